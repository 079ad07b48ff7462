//! # flow.ci Step Engine
//!
//! Executes the steps a flow.ci agent receives from its controller. A step is
//! a list of shell scripts plus an optional set of containers; the engine runs
//! it on the host, in Docker or on Kubernetes, streams its output line by line
//! and reports a terminal [`StepResult`](flowci_types::StepResult).
//!
//! ## Architecture
//!
//! - **`executor`**: the step lifecycle ([`StepExecutor`]) and the shell, Docker
//!   and Kubernetes backends behind the [`Backend`] seam
//! - **`logging`**: line splitting and the per-step log multiplexer
//! - **`demux`**: Docker's multiplexed attach stream decoder
//! - **`docker`**: a thin Docker Engine API client
//! - **`factory`**: backend selection for a step
//! - **`dispatcher`**: the single-slot command router that drives a step end to end
//! - **`cache`** and **`bins`**: step cache transfer and helper binaries for containers
//!
//! The engine never talks to the controller directly; it goes through the
//! [`ControllerClient`] and [`PluginFetcher`] capabilities.

pub mod bins;
pub mod cache;
pub mod context;
pub mod controller;
pub mod demux;
pub mod dispatcher;
pub mod docker;
pub mod error;
pub mod executor;
pub mod factory;
pub mod logging;

pub use context::{AgentContext, K8sSettings};
pub use controller::{ControllerClient, DownloadProgress, PluginFetcher};
pub use dispatcher::Dispatcher;
pub use error::{ControllerError, DispatchError, DockerError, ExecutorError};
pub use executor::{Backend, BackendKind, StepExecutor, StepRuntime};
pub use factory::{backend_kind, create_backend, create_executor};
pub use logging::{LogMultiplexer, LogSummary};

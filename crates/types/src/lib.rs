//! Shared type definitions for the flow.ci agent.
//!
//! - [`VariableStore`]: ordered variables with `${NAME}` resolution
//! - [`StepIn`], [`ContainerSpec`], [`DataVolumeSpec`]: step descriptors
//! - [`StepResult`], [`StepStatus`]: terminal outcome of a step
//! - [`LogItem`]: tagged log lines
//! - [`AgentCommand`], [`ControllerFrame`]: controller messages

pub mod log;
pub mod message;
pub mod result;
pub mod step;
pub mod variables;

pub use log::{LogItem, LogKind};
pub use message::{
    AgentCommand, AgentInfo, AgentInit, ControllerFrame, JobCache, Resource, Settings, ShellLogBody, ShellLogHeaders, TtyAction, TtyIn,
    TtyLogHeaders, TtyOut,
};
pub use result::{StepResult, StepStatus, exit_code};
pub use step::{CacheSpec, ContainerSpec, DataVolumeSpec, StepIn, StepSpecError, VOLUME_SEED_TARGET, parse_volume_specs};
pub use variables::{VariableError, VariableStore};

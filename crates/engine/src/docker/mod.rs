//! Docker Engine access used by the container backend.

pub mod client;
pub mod image;
pub mod models;

pub use client::{API_VERSION, DockerClient, PullStream};
pub use image::{normalize_image, split_reference};
pub use models::{ContainerConfig, ContainerInspect, ExecConfig, ExecInspect, HostConfig, PortBinding, PullProgress};

//! flow.ci controller client.
//!
//! The agent talks to its controller over two channels:
//!
//! - REST calls for registration, profiles, log upload and caches
//!   ([`HttpControllerClient`])
//! - a websocket carrying inbound commands and outbound log, tty and result
//!   frames ([`ControllerSession`])
//!
//! [`AgentClient`] combines both behind the engine's `ControllerClient` trait.

pub mod client;
pub mod http;
pub mod session;

pub use client::AgentClient;
pub use http::{HttpControllerClient, TOKEN_HEADER};
pub use session::{ControllerSession, frame_message, websocket_url};

//! scriptbox - run shell snippets from documentation in disposable sandboxes.
//!
//! A [`sandbox::Runner`] gives every browser session its own sandbox (a
//! container, a pod, or, for development, nothing at all) and the HTTP gateway
//! streams a script's output back line by line as server-sent events.

pub mod config;
pub mod error;
pub mod http_server;
pub mod sandbox;
pub mod session;
pub mod state;

pub use error::{Result, SandboxError};
pub use state::AppState;

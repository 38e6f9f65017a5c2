//! Shared application state handed to every request handler.

use std::sync::Arc;
use std::time::Duration;

use crate::sandbox::{Context, Runner};

/// Built once at startup; cloning only bumps the runner's refcount.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<dyn Runner>,
    /// Bound on control-plane waits per request. `None` waits as long as it takes.
    pub wait_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self {
            runner,
            wait_timeout: None,
        }
    }

    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Fresh context for one request.
    pub fn context(&self) -> Context {
        Context::new().with_timeout(self.wait_timeout)
    }
}

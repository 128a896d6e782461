//! Server state

use std::sync::Arc;

use secrecy::SecretString;

use crate::collect::store::LogStore;
use crate::control::surface::ControlSurface;

/// Server state shared across handlers
pub struct ServerState {
    pub surface: Arc<ControlSurface>,
    pub logs: Arc<LogStore>,
    /// Required in `X-Warden-Token` on webhook calls when set
    pub webhook_secret: Option<SecretString>,
}

impl ServerState {
    pub fn new(
        surface: Arc<ControlSurface>,
        logs: Arc<LogStore>,
        webhook_secret: Option<SecretString>,
    ) -> Self {
        Self {
            surface,
            logs,
            webhook_secret,
        }
    }
}

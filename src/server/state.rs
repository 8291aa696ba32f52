use std::sync::Arc;
use std::time::Instant;

use crate::broker::ServiceBroker;

/// Basic auth credentials; both empty disables auth.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn enabled(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<ServiceBroker>,
    pub credentials: Arc<Credentials>,
    pub started: Instant,
}

impl AppState {
    pub fn new(broker: Arc<ServiceBroker>, credentials: Credentials) -> Self {
        Self {
            broker,
            credentials: Arc::new(credentials),
            started: Instant::now(),
        }
    }
}

//! HTTP proxy that keeps the provider credential on the server.

pub mod error;
mod handlers;
pub mod protocol;
pub mod server;

use std::sync::Arc;

use teachback_core::TextCompletion;

pub use error::ProxyError;
pub use server::{create_router, run_server};

/// Shared by every request. `None` means no credential was configured.
#[derive(Clone, Default)]
pub struct ProxyState {
    completion: Option<Arc<dyn TextCompletion>>,
}

impl ProxyState {
    pub fn new(completion: Option<Arc<dyn TextCompletion>>) -> Self {
        Self { completion }
    }

    pub fn is_configured(&self) -> bool {
        self.completion.is_some()
    }

    pub(crate) fn client(&self) -> Result<Arc<dyn TextCompletion>, ProxyError> {
        self.completion.clone().ok_or(ProxyError::NotConfigured)
    }
}

mod request_id;

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::transport::UpstreamClient;

use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
///
/// Holds only immutable configuration and the pooled upstream client; every
/// relay keeps its own stream state.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamClient,
    request_ids: RequestIdGenerator,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, upstream: UpstreamClient) -> Self {
        Self {
            config,
            upstream,
            request_ids: RequestIdGenerator::new(),
        }
    }

    /// Build state with an upstream client derived from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when the upstream client cannot be built.
    pub fn from_config(config: AppConfig) -> Result<Self, RelayError> {
        let upstream = UpstreamClient::new(&config.server, &config.upstream)?;
        Ok(Self::new(config, upstream))
    }

    #[must_use]
    pub fn next_request_id(&self) -> uuid::Uuid {
        let seq = self.request_ids.next_seq();
        self.request_ids.request_uuid(seq)
    }
}

//! Application state.

use std::sync::Arc;

use vjob_worker::Pipeline;

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(config: ApiConfig, pipeline: Arc<Pipeline>) -> Self {
        Self { config, pipeline }
    }
}

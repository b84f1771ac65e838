//! tokend: per-identity token issuance, validation and revocation.
//!
//! The binary in `main.rs` is a thin shell over this library; integration
//! tests in `tests/` drive the same modules.

use std::sync::Arc;

pub mod api;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod service;
pub mod store;

use config::{Config, StoreBackend};
use service::TokenService;
use store::{FileTokenStore, MemoryTokenStore, StoreError, TokenStore};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub service: TokenService,
    pub config: Config,
}

impl AppState {
    /// Open the configured store and wire the service over it.
    pub fn from_config(config: Config) -> Result<Self, StoreError> {
        let store: Arc<dyn TokenStore> = match config.store {
            StoreBackend::File => Arc::new(FileTokenStore::open(&config.token_dir, config.locks)?),
            StoreBackend::Memory => {
                tracing::warn!("using in-memory token store: records are lost on restart");
                Arc::new(MemoryTokenStore::new(config.locks))
            }
        };
        let service = TokenService::new(store, config.issuance.clone());
        Ok(Self { service, config })
    }
}

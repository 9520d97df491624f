//! Application state shared across handlers.

use crate::auth::AuthService;
use crate::config::Config;
use crate::db::{Database, Publication};
use crate::entitlement::Entitlements;
use crate::error::{AppError, Result};
use crate::lcp::{self, LicenseServerClient, StatusClient};
use crate::opds::FeedBuilder;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Authentication service.
    pub auth: Arc<AuthService>,
    /// Entitlement facade.
    pub entitlements: Entitlements,
}

impl AppState {
    /// Create new application state with database.
    ///
    /// The License Server and status clients share one HTTP client carrying
    /// the configured timeout.
    pub fn new_with_db(config: Config, db: Database, auth: AuthService) -> Result<Self> {
        let http = lcp::http_client(config.lcp_server.timeout())?;
        let entitlements = Entitlements::new(
            db.clone(),
            LicenseServerClient::new(http.clone(), &config.lcp_server),
            StatusClient::new(http),
            config.license.status_workers,
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            auth: Arc::new(auth),
            entitlements,
        })
    }

    /// Get the base URL for generating links.
    pub fn base_url(&self) -> &str {
        self.config.server.public_base_url.trim_end_matches('/')
    }

    /// OPDS builder rooted at the public base URL.
    pub fn feeds(&self) -> FeedBuilder {
        FeedBuilder::new(self.base_url(), &self.config.server.title)
    }

    /// Look up a publication or fail with 404.
    pub fn publication(&self, id: &str) -> Result<Publication> {
        self.db
            .get_publication(id)?
            .ok_or_else(|| AppError::NotFound(format!("Publication not found: {}", id)))
    }
}

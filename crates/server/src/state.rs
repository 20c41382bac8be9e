//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::ServerConfig;
use crate::services::EmailAutomationService;
use crate::services::newsletter::NewsletterAdmin;

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc` and provides access to
/// shared resources like database connections and the automation service.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: ServerConfig,
    pool: PgPool,
    newsletters: Arc<dyn NewsletterAdmin>,
    automation: Arc<EmailAutomationService>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        pool: PgPool,
        newsletters: Arc<dyn NewsletterAdmin>,
        automation: Arc<EmailAutomationService>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                pool,
                newsletters,
                automation,
            }),
        }
    }

    /// Get a reference to the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Get a reference to the database connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// Get the newsletter persistence port used by the admin API.
    #[must_use]
    pub fn newsletters(&self) -> &Arc<dyn NewsletterAdmin> {
        &self.inner.newsletters
    }

    /// Get the shared email automation service.
    #[must_use]
    pub fn automation(&self) -> &Arc<EmailAutomationService> {
        &self.inner.automation
    }
}

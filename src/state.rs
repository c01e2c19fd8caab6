use crate::auth::TokenKeys;
use crate::config::Config;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Everything a handler needs, cloned into each request's context.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<Config>,
    pub keys: Arc<TokenKeys>,
}

impl AppState {
    pub fn new(db: DatabaseConnection, config: Config) -> Self {
        let keys = TokenKeys::from_config(&config.auth);
        AppState {
            db,
            config: Arc::new(config),
            keys: Arc::new(keys),
        }
    }
}

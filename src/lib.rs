pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod http;
pub mod models;
pub mod payments;
pub mod pins;
pub mod slug;
pub mod state;
pub mod subscriptions;
pub mod views;

pub use config::Config;
pub use error::{ApiError, Result};
pub use state::AppState;

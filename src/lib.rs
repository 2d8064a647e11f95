pub mod access;
pub mod auth;
pub mod collab;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod openapi;
pub mod rate_limit;
pub mod repo;
pub mod routes;
pub mod service;
pub mod telemetry;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
pub use service::{Collaborators, ConversationService};

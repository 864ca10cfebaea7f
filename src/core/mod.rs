pub mod analyzer;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod models;
pub mod notifications;
pub mod planner;
pub mod retry;
pub mod settings;
pub mod settings_store;

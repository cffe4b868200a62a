pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod deltas;
pub mod errors;
pub mod state_store;
pub mod streaming;
pub mod subscription_controller;
pub mod types;

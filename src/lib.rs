pub mod adapters;
pub mod aggregator;
pub mod app;
pub mod auth;
pub mod backends;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handlers;
pub mod normalize;
pub mod overrides;
pub mod router;
pub mod upstream;

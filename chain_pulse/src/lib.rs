pub mod cache;
pub mod delivery;
pub mod feed;
pub mod greeks;
pub mod hub;
pub mod model;
pub mod orchestrator;
pub mod pricing;
pub mod render;
pub mod reversal;
pub mod scheduler;
pub mod server;
pub mod summary;

pub mod config;

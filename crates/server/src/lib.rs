pub mod api;
pub mod engine;
pub mod metrics;
pub mod state;

pub mod config;
pub mod error;
pub mod event;
pub mod ingest;
pub mod metrics;
pub mod normalize;
pub mod retry;
pub mod store;
pub mod validation;

pub mod config;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod observability;
pub mod registry;
pub mod request;
pub mod slot;
pub mod store;
pub mod wal;

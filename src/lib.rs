pub mod clock;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;

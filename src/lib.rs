// Library exports for the binary and integration tests
pub mod clock;
pub mod config;
pub mod health;
pub mod metrics;
pub mod session;
pub mod sink;
pub mod storage;

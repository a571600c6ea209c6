// Hub daemon internals, exposed for integration tests and the binary.
pub mod config;
pub mod conn;
pub mod observability;
pub mod server;

pub mod config;
pub mod dashboard;
pub mod error;
pub mod notify;
pub mod queue;
pub mod server;
pub mod shutdown;
pub mod worker;

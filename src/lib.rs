pub mod config;
pub mod daemons;
pub mod domain;
pub mod errors;
pub mod event_sourcing;
pub mod messaging;
pub mod metrics;
pub mod rpc;

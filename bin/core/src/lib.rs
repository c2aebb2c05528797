//! The Disco core: deployment engine, scheduler, drivers and
//! runners. The `disco` binary wires these into the daemon and
//! worker processes; the HTTP layer binds the typed operations
//! exposed here to endpoints.

#[macro_use]
extern crate tracing;

pub mod caddy;
pub mod config;
pub mod docker;
pub mod domains;
pub mod encryption;
pub mod engine;
pub mod events;
pub mod github;
pub mod listener;
pub mod logs;
pub mod queue;
pub mod runners;
pub mod schedule;
pub mod startup;
pub mod state;
pub mod syslog;

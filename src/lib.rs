//! Switchboard - a TCP proxy that runs one disposable container per connection
//!
//! This library provides an admission-controlled, on-demand compute backend
//! fronted by a TCP proxy:
//! - Listens on a set of published ports, one Docker image per port
//! - Launches a fresh container for every accepted connection
//! - Enforces a per-image cap on concurrently running containers
//! - Waits until the backend actually serves (connect plus first byte)
//!   before relaying any client traffic
//! - Relays bytes transparently in both directions
//! - Tears the container down when either side disconnects

pub mod config;
pub mod docker;
pub mod error;
pub mod instance;
pub mod manager;
pub mod proxy;

//! Wakegate - a wake-on-demand reverse TCP proxy for sleeping hosts
//!
//! This library fronts services on physical machines that power down when
//! idle:
//! - Listens on public-facing ports for each proxied service
//! - Wakes the backing host (Wake-on-LAN) when client traffic arrives
//! - Buffers client bytes until the host answers reachability probes,
//!   then relays the connection transparently
//! - Suspends the host again (over SSH) after a configurable idle period
//! - Discovers services from static config and Docker container labels
//! - Exposes an HTTP control API for host status, start/stop and options

pub mod admin;
pub mod config;
pub mod control;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod messages;
pub mod notify;
pub mod probe;
pub mod relay;
pub mod remote;
pub mod supervisor;
pub mod wol;
pub mod worker;

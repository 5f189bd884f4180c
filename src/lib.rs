//! Hostmux - a single-host multiplexer for long-running web backends
//!
//! This library provides:
//! - A `domain,scriptPath` mapping file applied to a registry of supervisors
//! - One supervisor per domain that launches the script on a fresh local
//!   port and restarts it after it exits
//! - A reverse proxy that routes by Host header, including WebSocket upgrades
//! - Per-domain reloads through a command channel and the admin API

pub mod admin;
pub mod config;
pub mod error;
pub mod pool;
pub mod port;
pub mod proxy;
pub mod reconcile;
pub mod registry;
pub mod reload;
pub mod supervisor;

//! Portico - a thin reverse proxy and lifecycle shim for a sandboxed gateway
//!
//! This library provides a front for a single containerized gateway process:
//! - Forwards HTTP and WebSocket traffic to the gateway on a fixed local port
//! - Locates an already-running gateway, or spawns one on demand and waits
//!   for its startup marker in the process output
//! - Runs device-pairing operations through an external CLI, detecting
//!   success by substring match over its output
//! - Mounts a remote object-storage bucket idempotently and periodically
//!   synchronizes a local data directory into it

pub mod admin;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod gateway;
pub mod mount;
pub mod pairing;
pub mod proxy;
pub mod sync;
pub mod wait;

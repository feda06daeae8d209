//! light-http - local static-file servers stitched together by path aliases
//!
//! This library provides:
//! - [`ServerInstance`](instance::ServerInstance), a supervisor for one named
//!   server with an optional HTTP and an optional HTTPS listener
//! - Path aliases that forward `/{prefix}/...` to another server's listen URL
//! - A pluggable serve primitive ([`Serve`](listener::Serve)) with a hyper based
//!   static file implementation
//! - A persisted fleet of servers backed by a JSON configuration file

pub mod config;
pub mod error;
pub mod fleet;
pub mod instance;
pub mod listener;
pub mod pool;
pub mod rewrite;
pub mod server;
pub mod tls;

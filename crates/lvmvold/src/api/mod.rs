//! Volume plugin HTTP API.

pub mod server;

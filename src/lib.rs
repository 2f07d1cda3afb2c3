//! knotroute - source-routed proxy chaining through DNS hostnames
//!
//! A multi-hop proxy chain is tied into a base32 label under a stem
//! hostname (`q--<payload>.stem.example.com`). A router at each hop sniffs
//! the SNI/Host field of incoming TLS, HTTP, or SOCKS traffic, unties one
//! knot, rewrites the remaining chain back into the field, and relays the
//! connection to the next hop or to a terminal backend.

pub mod chain;
pub mod config;
pub mod pool;
pub mod ports;
pub mod server;
pub mod sniff;
pub mod util;

pub use config::Config;
pub use server::Server;

/// Router version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! realm-gate: transport core for a persistent-world game server.
//!
//! - Framed binary wire protocol with checksums and per-version payload
//!   encodings
//! - Client version handshake and per-version handler dispatch
//! - Coalescing, single-flight outbound queue per connection
//! - Connection registry, session state machine and link-dead handling
//! - Configuration via CLI arguments or TOML file

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod net;
pub mod server;
pub mod session;
pub mod stats;

pub use config::Config;
pub use server::{Server, ServerContext, ServerError};

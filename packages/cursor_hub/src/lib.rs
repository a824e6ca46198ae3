// Library interface for cursor_hub
// Exposes the hub core and its HTTP surface for embedding in other applications

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod mailbox;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod stats;

pub use config::{Args, HubSettings, ServerConfig, TlsPaths};
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use protocol::{ClientMessage, ConnectionId, CursorState, ServerMessage, Snapshot};
pub use server::{build_router, load_tls_config, serve_plain, serve_tls};

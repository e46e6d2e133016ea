// Export all modules for public use
pub mod config;
pub mod network;
pub mod protocol;
pub mod server;
pub mod utils;

// Re-export the most commonly used items for convenience
pub use crate::config::{ConfigError, ServerArgs, ServerSettings};
pub use crate::network::{AddressPool, InterfaceProvider, TunInterfaceProvider};
pub use crate::protocol::{Message, MessageError, TunnelCodec};
pub use crate::server::{ServerContext, ServerError, TunnelServer};

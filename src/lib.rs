pub mod config;
pub mod network;

pub use config::{DaemonConfig, NegotiationSettings};
pub use network::ike::sa::IKESession;
pub use network::ike::session::IKEDaemon;
pub use network::ike::IKEError;

pub mod client;
pub mod error;
pub mod handler;
pub mod known_hosts;
pub mod tunnel;

pub use client::SshClient;
pub use error::{Result, SshError};
pub use tunnel::{TunnelHandle, TunnelHealth, TunnelManager, TunnelStatus};

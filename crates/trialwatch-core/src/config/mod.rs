pub mod app_config;
pub mod connection;
pub mod keychain;

pub use app_config::AppConfig;
pub use connection::{resolve, Backend, CertPolicy, ConnectionDescriptor, ConnectionParams};

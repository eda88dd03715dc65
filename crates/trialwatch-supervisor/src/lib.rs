pub mod error;
pub mod process;
pub mod service;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use service::{ServiceExit, ServiceSet, Termination};
pub use supervisor::{BrowserSpec, DashboardSpec, LaunchSpec, Supervisor, SupervisorHandle};

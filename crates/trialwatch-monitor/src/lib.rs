pub mod error;
pub mod monitor;
pub mod store;

pub use error::{Result, StoreError};
pub use monitor::{CycleReport, Monitor};
pub use store::{HttpStore, MemoryStore, TrialStore};

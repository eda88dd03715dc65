pub mod rules;
pub mod service;
pub mod trial;
pub mod tunnel;

pub use rules::*;
pub use service::*;
pub use trial::*;
pub use tunnel::*;

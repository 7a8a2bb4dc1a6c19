// Data Engine Module
// Uniform client abstraction over SQL and N1QL engines

pub mod classify;
pub mod config;
pub mod dialect;
pub mod drivers;
pub mod error;
pub mod maintenance;
pub mod normalize;
pub mod registry;
pub mod session;
pub mod traits;
pub mod types;

pub use config::resolve;
pub use error::{EngineError, EngineResult};
pub use registry::{DriverRegistry, EngineDescriptor, EngineKind};
pub use session::ConnectionSession;
pub use traits::DataEngine;
pub use types::*;

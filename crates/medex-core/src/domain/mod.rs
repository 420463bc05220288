pub mod error;
pub mod models;

pub use error::{EngineError, Result};
pub use models::*;

pub mod context;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod settings;
pub mod utils;

pub use context::EngineContext;
pub use errors::{EngineError, Result};
pub use settings::Settings;

// Core modules
pub mod api;
pub mod chart;
pub mod error;
pub mod execution;
pub mod models;
pub mod session;
pub mod settings;

// Re-export commonly used types
pub use api::TradingBackend;
pub use error::{DeskError, NetworkError, ValidationError};
pub use models::*;
pub use session::{DeskEvent, Intent, Session};

// Error handling
pub type Result<T> = std::result::Result<T, DeskError>;

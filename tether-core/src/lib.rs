pub mod config;
pub mod error;
pub mod models;

pub use config::*;
pub use error::*;
pub use models::*;

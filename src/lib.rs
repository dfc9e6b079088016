pub mod app;
pub mod config;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod records;
pub mod series;
pub mod store;
pub mod utils;

pub use error::{AppError, Result};

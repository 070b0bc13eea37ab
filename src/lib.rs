pub mod cache;
pub mod clustering;
pub mod config;
pub mod detector;
pub mod ensemble;
pub mod error;
pub mod extraction;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod segments;
pub mod service;
pub mod signal;
pub mod store;

pub use error::{AnalysisError, Result};
pub use service::AnalysisService;

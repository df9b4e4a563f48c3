//! Inbox ETL: email batch pipeline orchestration.

pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod mail;
pub mod metrics;
pub mod pipeline;
pub mod store;

pub use error::{Error, Result};

//! Core types and utilities for the dryer-line model lifecycle.
//!
//! This crate holds the pieces every other crate agrees on: the production
//! record layout, the hyperparameter set, the error taxonomy, and the
//! regression metrics used to score models.

pub mod cli;
pub mod coercion;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use cli::*;
pub use coercion::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;

pub mod prelude {
    pub use crate::coercion::CoercionLog;
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}

//! Continual learning and lifecycle control for dryer-line models.
//!
//! This crate provides:
//! - One-epoch fine-tuning with selective conv-stage freezing
//! - A buffer of live production examples consumed by fine-tuning
//! - `ModelSession`, the per-model lifecycle controller
//! - `ModelHandle`, per-instance locking and background runs

pub mod finetuning;
pub mod handle;
pub mod production;
pub mod session;

pub use finetuning::{fine_tune, plan_trainability, FineTuneMode, FineTuneReport, TrainabilityPlan};
pub use handle::{BackgroundRun, ModelHandle};
pub use production::ProductionBuffer;
pub use session::ModelSession;

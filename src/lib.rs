//! ChainFlow - Dependency-aware background work orchestrator
//!
//! Work units are grouped into stages that run one after another; the units
//! of a stage run in parallel and their merged output feeds the next stage.
//! Units retry with linear or exponential backoff, graphs can be submitted
//! under a unique name with a replace/keep/append policy, and every stage
//! launch waits for its device constraints to hold.

pub mod cli;
pub mod constraints;
pub mod dag;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod state;
pub mod tasks;
pub mod templates;

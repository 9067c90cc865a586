#![recursion_limit = "256"]

pub mod batch_size;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod msg;
pub mod schedule;
pub mod stopping;
pub mod train;

pub use error::{CheckpointError, Result, TrainError};

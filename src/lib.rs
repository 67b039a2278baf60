//! Userspace consumer for kernel-captured HTTP transactions.
//!
//! A kernel probe writes fixed-size pages of HTTP transactions into a shared
//! per-CPU map and emits a notification whenever a page fills. This crate
//! drains those pages without blocking the producer, folds the transactions
//! into per-endpoint statistics, and accounts for everything it could not
//! deliver.

pub mod batch;
pub mod config;
pub mod health;
pub mod monitor;
pub mod probe;
pub mod stats;
pub mod telemetry;
pub mod transaction;

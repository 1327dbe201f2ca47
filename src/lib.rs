//! Synthetic multi-axis workload generator: spins up independently-rated
//! CPU/memory/disk/network worker threads from a small text command
//! language, optionally chained into link rings or after-dependency
//! chains, calibrated against the host's actual throughput so requested
//! rates hold regardless of machine speed.

pub mod after;
pub mod calibrator;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod lockmgr;
pub mod master;
pub mod reaper;
pub mod registry;
pub mod worker;

pub use error::{EngineError, Result};

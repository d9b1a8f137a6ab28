//! Node utilization sampler: periodic process table snapshots aggregated
//! into per-user and host-wide utilization records.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod filter;
pub mod measure;
pub mod monitor;
pub mod replay;
pub mod sampler;

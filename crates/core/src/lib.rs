//! Core library: cache sync, tag scoring, candidate selection, vote import
//! and the wiring that ties them to config.

pub mod audit;
pub mod config;
pub mod pipeline;
pub mod rate_limit;
pub mod record;
pub mod retry;
pub mod scoring;
pub mod selector;
pub mod snapshot;
pub mod sync;
pub mod votes;

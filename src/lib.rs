//! repowatch: continuous credential scanning for a fleet of git repositories

pub mod app;
pub mod changes;
pub mod cloner;
pub mod config;
pub mod core;
pub mod discovery;
pub mod git;
pub mod github;
pub mod headcount;
pub mod metrics;
pub mod notify;
pub mod pool;
pub mod push;
pub mod queue;
pub mod rescanner;
pub mod scanner;
pub mod sniff;
pub mod stats;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

include!(concat!(env!("OUT_DIR"), "/version.rs"));

//! Side-effecting adapters: files, processes and agents.

pub mod agent;
pub mod atomic;
pub mod config;
pub mod gates;
pub mod iteration_log;
pub mod journal;
pub mod layout;
pub mod manifest_store;
pub mod process;
pub mod prompt;
pub mod provenance;
pub mod run_index;
pub mod skills;
pub mod tools;

//! I/O helpers: config, providers, search, persistence and logs.

pub mod approval;
pub mod config;
pub mod init;
pub mod iteration_log;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod run_store;
pub mod search;

// ABOUTME: Library crate for mediaworkers exposing the worker pool and tag reader client
// ABOUTME: The CLI and worker binaries are thin wrappers over these modules

//! Runs crash-prone media tag work in helper processes.
//!
//! [`worker_pool`] supervises the processes and matches responses to
//! requests; [`tagreader`] is the typed client built on top of it.

/// Command-line interface
pub mod cli;
/// `config.toml` loading
pub mod config;
/// Tracing subscriber and panic hook setup
pub mod logging;
/// Tag reader client, protocol and worker service
pub mod tagreader;
/// Out-of-process worker pool
pub mod worker_pool;

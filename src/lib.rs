//! Modvisor is a small toolkit for running and supervising script "modules":
//! directories of scripts described by a `module.yaml` manifest. It launches
//! scripts as supervised child processes with captured output, watches files
//! for changes and drives start/stop/running services with an on-disk
//! disabled marker.

/// CLI interface.
pub mod cli;

/// Hex transport codec shared with child scripts.
pub mod codec;

/// Configuration management.
pub mod config;

/// Shared console sink for child output.
pub mod console;

/// Dependency bundle handed to modules.
pub mod context;

/// Error handling.
pub mod error;

/// Modules and module discovery.
pub mod module;

/// Managed child processes.
pub mod process;

/// Default runtime directories.
pub mod runtime;

/// Services inside modules.
pub mod service;

/// Persistent key/value store.
pub mod store;

/// File-change detection.
pub mod watch;

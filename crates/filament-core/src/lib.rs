//! # filament-core
//!
//! Dependency-free core types for the filament fiber runtime.
//!
//! This crate provides:
//! - Fiber lifecycle states
//! - Error types shared across the runtime
//! - Environment variable helpers backing runtime configuration
//! - Kernel-style logging macros (`kprint!`, `kerror!`, ...)

pub mod env;
pub mod error;
pub mod kprint;
pub mod state;

// Re-exports
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
pub use error::{FiberError, ReactorError, RtResult};
pub use state::FiberState;

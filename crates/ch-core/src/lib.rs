//! Shared configuration for the chorus orchestration crates.

pub mod config;

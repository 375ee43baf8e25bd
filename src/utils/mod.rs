//! Utility functions and types

mod config;

pub use config::Config;

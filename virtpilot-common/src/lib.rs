//! # virtpilot Common
//!
//! Shared utilities for the virtpilot components.
//!
//! ```rust,no_run
//! use virtpilot_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!("ready");
//! ```

pub mod logging;

pub use logging::{build_filter, init_logging, LogFormat};

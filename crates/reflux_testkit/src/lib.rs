//! # Reflux Testkit
//!
//! Test utilities for reflux.
//!
//! This crate provides:
//! - Test fixtures and store helpers
//! - The demo model/view scenario replayed under each reentrance policy
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use reflux_testkit::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn cancel_previous() {
//!     let report = run_reentrance_scenario(Reentrance::CancelPrevious).await.unwrap();
//!     assert_eq!(report.log, vec!["RTA", "nezaboodka.com/500"]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use reflux_core::Reentrance;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;

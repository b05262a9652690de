//! Docsmith keeps a project's code and its documentation consistent.
//!
//! File events flow through a [`Pipeline`](core::Pipeline): the changed file
//! is parsed, diffed against the project graph, its impact is traced through
//! dependents, and any issues found are planned, gated on confidence, applied
//! with a backup or queued for review, and recorded as lessons.

pub mod config;
pub mod core;
pub mod error;

pub use config::Config;
pub use error::{DocsmithError, Result};

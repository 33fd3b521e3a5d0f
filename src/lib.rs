// SPDX-License-Identifier: MIT

//! Bugwatch: field insect-detection camera pipeline
//!
//! A camera captures a still image every N seconds, an external inference
//! service classifies it for insect species, an operator channel is
//! optionally notified, and the outcome lands in a SQLite log and one of
//! three image directories. The detection log is queryable through a small
//! web dashboard.

pub mod area;
pub mod capture;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod notifier;
pub mod orchestrator;
pub mod web;

pub use config::AppConfig;
pub use error::{BugwatchError, Result};

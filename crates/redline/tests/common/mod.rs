//! Shared test utilities for redline integration tests.
//!
//! This module provides:
//! - `TestHarness` for running an engine against a temp data directory
//! - Scripted suggestion services and a DOCX builder

pub mod harness;
pub mod suggesters;

pub use harness::{build_docx, TestHarness};
pub use suggesters::{ConcurrencyMeter, SlowWhen};

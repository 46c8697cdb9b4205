//! Reliability patterns for store access
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff

mod retry;

pub use retry::{RetryExhausted, RetryPolicy};

//! Bounded retry with exponential backoff
//!
//! Used by the agent's dial steps: every failed attempt is classified,
//! logged, and retried after a growing delay until the attempt budget runs out.

pub mod policy;

pub use policy::{Backoff, RetryError, RetryPolicy, Retryable};

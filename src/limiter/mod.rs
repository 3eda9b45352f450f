//! Sliding-window rate limiting.

mod sliding;
mod slot;

pub use sliding::{RateCheck, RateDenyReason, SlidingWindowLimiter};
pub use slot::SlotGuard;

/// Estimate the token cost of a request before it is made.
///
/// True usage is unknown until the backend responds, so the estimate is the
/// usual chars/4 approximation of the input plus a configured buffer for
/// the expected output. The ledger reconciles against actual usage after
/// the call.
pub fn estimate_tokens(input: &str, expected_output: u64) -> u64 {
    (input.chars().count() as u64).div_ceil(4) + expected_output
}

//! Retry/backoff policy.
//!
//! Pure function of attempt number plus config — no sleeping happens here.
//! Callers (`ingest-io::consumer`, `ingest-io::table_writer`) own the actual
//! `tokio::time::sleep`, which keeps this module synchronous and trivially
//! testable.

use std::time::Duration;

use rand::Rng;

/// `base * 2^(attempt-1)` with +/-25% jitter, capped at `max`. `attempt` is
/// 1-based: the first retry passes `attempt = 1`.
pub fn backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let unjittered = base_ms.saturating_mul(1u64 << exp).min(max_ms);
    let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered = (unjittered as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Whether `attempt` (1-based, the attempt about to be made) is still within
/// `max_attempts`. Exceeding the bound promotes the failure to NonRetriable
/// and routes it to the DLR.
pub fn within_budget(attempt: u32, max_attempts: u32) -> bool {
    attempt <= max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_respects_cap() {
        let b1 = backoff(200, 30_000, 1).as_millis() as f64;
        let b2 = backoff(200, 30_000, 2).as_millis() as f64;
        // allow jitter overlap but the midpoints should roughly double
        assert!(b1 <= 250.0);
        assert!(b2 <= 500.0);
        let capped = backoff(200, 1_000, 10);
        assert!(capped.as_millis() as u64 <= 1_250);
    }

    #[test]
    fn within_budget_boundary() {
        assert!(within_budget(5, 5));
        assert!(!within_budget(6, 5));
    }

    proptest::proptest! {
        #[test]
        fn backoff_never_exceeds_cap(base in 1u64..5_000, max in 1u64..60_000, attempt in 1u32..40) {
            let delay = backoff(base, max, attempt).as_millis() as u64;
            // jitter can push the raw computation up to 25% over `max`; bound against that.
            proptest::prop_assert!(delay <= max + max / 4 + 1);
        }
    }
}

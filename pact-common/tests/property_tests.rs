//! Property-based tests for pact-common crate.
//!
//! These tests verify universal properties across all inputs using proptest.

use pact_common::{Backoff, RetryPolicy, TransportError};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

// **Property 1: Status Retryability**
// *For any* status code, a transport error is retryable exactly when the
// status denotes a server-side or throttling failure.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_status_retryability(status in 100u16..600) {
        let err = TransportError::status(status, "http://broker.local/pacts");
        let expected = status >= 500 || status == 429;
        prop_assert_eq!(err.is_retryable(), expected, "status {}", status);
    }

    #[test]
    fn prop_messages_preserved(msg in "[a-zA-Z0-9 ]{1,50}") {
        let err = TransportError::unavailable(msg.clone());
        prop_assert!(err.to_string().contains(&msg));
        prop_assert!(err.is_retryable());

        let err = TransportError::invalid_input(msg.clone());
        prop_assert!(err.to_string().contains(&msg));
        prop_assert!(!err.is_retryable());
    }
}

// **Property 2: Bounded Backoff**
// *For any* attempt number, the wait never exceeds the ceiling plus the
// spread allowance, and without spread it never decreases.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_backoff_bounded(attempt in 0u32..40, ceiling_ms in 100u64..5_000) {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(ceiling_ms));
        let wait = backoff.wait(attempt);
        prop_assert!(wait.as_millis() <= u128::from(ceiling_ms) * 5 / 4 + 1);
    }

    #[test]
    fn prop_backoff_monotonic_without_spread(attempt in 0u32..40) {
        let backoff = Backoff::default().without_spread();
        prop_assert!(backoff.wait(attempt) <= backoff.wait(attempt + 1));
    }

    #[test]
    fn prop_attempts_are_bounded(retries in 0u32..6) {
        let policy = RetryPolicy::new(retries, Backoff::new(Duration::ZERO, Duration::ZERO));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = tokio_test::block_on(policy.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::unavailable("down")) }
        }));
        prop_assert!(result.is_err());
        prop_assert_eq!(calls.load(Ordering::SeqCst), retries + 1);
    }
}

//! Property tests for backoff growth and jitter.

use std::time::Duration;

use proptest::prelude::*;
use tower_callable::retry::{jittered, BackoffParams};

fn backoff() -> impl Strategy<Value = BackoffParams> {
    (1u64..5_000, 100u32..400, 0u64..120_000).prop_map(|(initial, mult, extra)| {
        BackoffParams::new(
            Duration::from_millis(initial),
            f64::from(mult) / 100.0,
            Duration::from_millis(initial + extra),
        )
    })
}

proptest! {
    #[test]
    fn ceilings_never_exceed_max_and_never_shrink(params in backoff(), n in 1u32..40) {
        let current = params.ceiling(n);
        let next = params.ceiling(n + 1);
        prop_assert!(current <= params.max_delay);
        prop_assert!(next >= current);
        prop_assert!(next <= params.max_delay);
    }

    #[test]
    fn ceiling_matches_closed_form(params in backoff(), n in 1u32..20) {
        let exact = params.initial_delay.as_secs_f64() * params.delay_multiplier.powi(n as i32 - 1);
        let expected = exact.min(params.max_delay.as_secs_f64());
        let actual = params.ceiling(n).as_secs_f64();
        // Each step rounds to whole nanoseconds.
        prop_assert!((actual - expected).abs() <= expected * 1e-4 + 1e-9);
    }

    #[test]
    fn jitter_stays_below_ceiling(ceiling_ms in 1u64..10_000) {
        let ceiling = Duration::from_millis(ceiling_ms);
        prop_assert!(jittered(ceiling) < ceiling);
    }

    #[test]
    fn validated_params_accept_generated_values(params in backoff()) {
        prop_assert!(params.validate().is_ok());
    }
}

// Crash-restart backoff policy
//
// Exponential ladder: delay = base * 2^consecutive_crashes, capped. The
// counter only grows on crash exits and resets once a run stays up longer
// than the clean-run threshold, so a bot that finally stabilizes gets its
// fast restarts back.

use tracing::info;

use crate::domain::App;

/// Maximum exponent fed into the ladder; the cap flattens it long before
/// this, it only guards the shift against overflow.
const MAX_BACKOFF_EXPONENT: u32 = 20;

pub struct RestartPolicy {
    base_delay_ms: i64,
    max_delay_ms: i64,
    clean_run_threshold_ms: i64,
}

impl RestartPolicy {
    pub fn new(base_delay_ms: i64, max_delay_ms: i64, clean_run_threshold_ms: i64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            clean_run_threshold_ms,
        }
    }

    /// Delay for the given consecutive-crash count
    pub fn delay_for(&self, crashes: u32) -> i64 {
        let exp = crashes.min(MAX_BACKOFF_EXPONENT);
        self.base_delay_ms
            .saturating_mul(1i64 << exp)
            .min(self.max_delay_ms)
    }

    /// Account for a finished run and return the restart delay to use if
    /// the app is restarted.
    ///
    /// `uptime_ms` is None when the process never reached RUNNING (spawn
    /// failure). Crash exits advance the ladder; non-crash exits restart at
    /// the base delay without touching the counter.
    pub fn on_run_end(&self, app: &mut App, uptime_ms: Option<i64>, crashed: bool) -> i64 {
        if uptime_ms.is_some_and(|u| u >= self.clean_run_threshold_ms) && app.crash_backoff > 0 {
            info!(app = %app.key, "Clean run, resetting crash backoff");
            app.crash_backoff = 0;
        }

        if crashed {
            let delay = self.delay_for(app.crash_backoff);
            app.crash_backoff += 1;
            delay
        } else {
            self.delay_for(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AppKey, RestartPolicy as Policy};

    fn app() -> App {
        App::new(AppKey::new("t1", "a"), "main.py", Policy::Auto, 1000)
    }

    #[test]
    fn ladder_doubles_up_to_cap() {
        let policy = RestartPolicy::new(1_000, 8_000, 30_000);
        let mut app = app();

        // four consecutive fast crashes: 1s, 2s, 4s, 8s
        let mut delays = vec![];
        for _ in 0..5 {
            delays.push(policy.on_run_end(&mut app, Some(10), true));
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000]);
    }

    #[test]
    fn delays_are_monotonically_non_decreasing() {
        let policy = RestartPolicy::new(500, 60_000, 30_000);
        let mut app = app();
        let mut last = 0;
        for _ in 0..12 {
            let d = policy.on_run_end(&mut app, Some(0), true);
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn clean_run_resets_ladder() {
        let policy = RestartPolicy::new(1_000, 8_000, 30_000);
        let mut app = app();

        policy.on_run_end(&mut app, Some(10), true);
        policy.on_run_end(&mut app, Some(10), true);
        assert_eq!(app.crash_backoff, 2);

        // crashed again, but after a long healthy run: ladder starts over
        let d = policy.on_run_end(&mut app, Some(31_000), true);
        assert_eq!(d, 1_000);
        assert_eq!(app.crash_backoff, 1);
    }

    #[test]
    fn short_run_does_not_reset() {
        let policy = RestartPolicy::new(1_000, 8_000, 30_000);
        let mut app = app();
        policy.on_run_end(&mut app, Some(10), true);
        let d = policy.on_run_end(&mut app, Some(29_999), true);
        assert_eq!(d, 2_000);
    }

    #[test]
    fn non_crash_exit_keeps_counter_and_uses_base() {
        let policy = RestartPolicy::new(1_000, 8_000, 30_000);
        let mut app = app();
        policy.on_run_end(&mut app, Some(10), true);
        policy.on_run_end(&mut app, Some(10), true);

        // clean exit shortly after start: base delay, counter untouched
        let d = policy.on_run_end(&mut app, Some(10), false);
        assert_eq!(d, 1_000);
        assert_eq!(app.crash_backoff, 2);
    }

    #[test]
    fn spawn_failure_has_no_uptime() {
        let policy = RestartPolicy::new(1_000, 8_000, 30_000);
        let mut app = app();
        let d = policy.on_run_end(&mut app, None, true);
        assert_eq!(d, 1_000);
        assert_eq!(app.crash_backoff, 1);
    }
}

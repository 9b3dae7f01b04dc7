use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for retryable failures.
///
/// The delay for attempt `n` (zero-based) is `base * factor^n`, capped at
/// `cap`, with up to `jitter` fraction added or removed at random so that
/// workers retrying against the same dependency do not stampede it.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exponential.min(self.cap.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let span = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-span..=span)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = without_jitter();

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(32));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = without_jitter();

        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(30), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();

        for attempt in 0..8 {
            let unjittered = without_jitter().delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.delay(attempt).as_secs_f64();
                assert!(delay >= unjittered * 0.8 - f64::EPSILON);
                assert!(delay <= unjittered * 1.2 + f64::EPSILON);
            }
        }
    }
}

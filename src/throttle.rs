use crate::now_ms;

const MIN_UPDATE_INTERVAL_MS: i64 = 1000;
const MIN_PROGRESS_DELTA: f64 = 5.0;
const COMPLETE_PROGRESS: f64 = 100.0;

/// Rate limit for progress writes: one per second or per 5 points of
/// progress, whichever comes first, plus the final 100%.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressThrottle {
    last_update_ms: i64,
    last_progress: f64,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self {
            last_update_ms: 0,
            last_progress: -1.0,
        }
    }
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_update(&self, progress: f64) -> bool {
        self.should_update_at(progress, now_ms())
    }

    pub fn should_update_at(&self, progress: f64, now_ms: i64) -> bool {
        progress == COMPLETE_PROGRESS
            || now_ms - self.last_update_ms > MIN_UPDATE_INTERVAL_MS
            || progress - self.last_progress >= MIN_PROGRESS_DELTA
    }

    /// Call only after `should_update` accepted `progress`.
    pub fn update(&mut self, progress: f64) {
        self.update_at(progress, now_ms());
    }

    pub fn update_at(&mut self, progress: f64, now_ms: i64) {
        self.last_update_ms = now_ms;
        self.last_progress = progress;
    }

    pub fn last_progress(&self) -> f64 {
        self.last_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_is_accepted_after_epoch() {
        let throttle = ProgressThrottle::new();
        assert!(throttle.should_update_at(0.1, 5_000));
        assert!(throttle.should_update(0.1));
    }

    #[test]
    fn small_step_inside_window_is_rejected() {
        let mut throttle = ProgressThrottle::new();
        throttle.update_at(10.0, 10_000);
        assert!(!throttle.should_update_at(14.9, 10_500));
        assert!(!throttle.should_update_at(10.0, 11_000));
    }

    #[test]
    fn five_point_step_is_accepted_inside_window() {
        let mut throttle = ProgressThrottle::new();
        throttle.update_at(10.0, 10_000);
        assert!(throttle.should_update_at(15.0, 10_001));
    }

    #[test]
    fn elapsed_time_must_strictly_exceed_one_second() {
        let mut throttle = ProgressThrottle::new();
        throttle.update_at(10.0, 10_000);
        assert!(!throttle.should_update_at(10.5, 11_000));
        assert!(throttle.should_update_at(10.5, 11_001));
    }

    #[test]
    fn completion_is_always_accepted() {
        let mut throttle = ProgressThrottle::new();
        throttle.update_at(99.9, 10_000);
        assert!(throttle.should_update_at(100.0, 10_000));
    }

    #[test]
    fn rejected_calls_leave_state_untouched() {
        let mut throttle = ProgressThrottle::new();
        throttle.update_at(20.0, 10_000);
        let before = throttle;
        for (progress, at) in [(21.0, 10_100), (22.0, 10_200), (24.9, 10_900)] {
            assert!(!throttle.should_update_at(progress, at));
        }
        assert_eq!(throttle, before);
        // Deltas are measured from the last accepted update, not the last seen value.
        assert!(throttle.should_update_at(25.0, 10_950));
    }

    #[test]
    fn accepted_sequence_matches_rule_for_a_simulated_stream() {
        let mut throttle = ProgressThrottle::new();
        let stream = [
            (1.0, 1_000_000),
            (2.0, 1_000_100),
            (6.5, 1_000_200),
            (7.0, 1_001_300),
            (7.5, 1_001_400),
            (100.0, 1_001_401),
        ];
        let mut accepted = Vec::new();
        for (progress, at) in stream {
            if throttle.should_update_at(progress, at) {
                throttle.update_at(progress, at);
                accepted.push(progress);
            }
        }
        assert_eq!(accepted, vec![1.0, 6.5, 7.0, 100.0]);
        assert_eq!(throttle.last_progress(), 100.0);
    }
}

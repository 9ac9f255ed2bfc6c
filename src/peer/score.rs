//! Rolling per-peer performance history used for ranking and punishment.
use std::collections::VecDeque;
use std::time::Duration;

/// Bounded history of the last `capacity` request outcomes, used to rank
/// peers (higher success rate / lower latency served first) and to derive
/// a punishment delay after a run of failures.
///
/// New peers start with an optimistic history (all successes, zero
/// duration) rather than an empty one, so a freshly connected peer isn't
/// penalized relative to established ones before it has a track record.
#[derive(Debug, Clone)]
pub struct Score {
    capacity: usize,
    history: VecDeque<(bool, Duration)>,
}

impl Score {
    pub fn new(capacity: usize) -> Self {
        let mut history = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            history.push_back((true, Duration::ZERO));
        }
        Score { capacity, history }
    }

    /// Records the outcome of one resolved block request, evicting the
    /// oldest entry.
    pub fn update(&mut self, result: bool, duration: Duration) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back((result, duration));
    }

    pub fn success_rate(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        let successes = self.history.iter().filter(|(ok, _)| *ok).count();
        successes as f64 / self.capacity as f64
    }

    pub fn avg_duration(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.history.iter().map(|(_, d)| *d).sum();
        total / self.history.len() as u32
    }

    /// Delay to impose on this peer before it is next considered ready,
    /// proportional to its recent failure rate. `punish_max` is the delay
    /// applied to a peer with a 0% success rate.
    pub fn punishment_delay(&self, punish_max: Duration) -> Duration {
        let error_rate = 1.0 - self.success_rate();
        punish_max.mul_f64(error_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_optimistic() {
        let score = Score::new(4);
        assert_eq!(score.success_rate(), 1.0);
        assert_eq!(score.avg_duration(), Duration::ZERO);
    }

    #[test]
    fn tracks_bounded_window() {
        let mut score = Score::new(2);
        score.update(false, Duration::from_secs(1));
        score.update(false, Duration::from_secs(1));
        // both slots now failures; success rate should be 0.
        assert_eq!(score.success_rate(), 0.0);
        score.update(true, Duration::from_millis(100));
        // oldest failure evicted; one failure, one success left.
        assert_eq!(score.success_rate(), 0.5);
    }

    #[test]
    fn punishment_scales_with_failure_rate() {
        let mut score = Score::new(4);
        for _ in 0..4 {
            score.update(false, Duration::from_secs(1));
        }
        let delay = score.punishment_delay(Duration::from_secs(8));
        assert_eq!(delay, Duration::from_secs(8));
    }
}

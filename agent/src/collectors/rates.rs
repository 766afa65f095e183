//! Finite differencing of monotone cumulative counters into per-second
//! rates.

use std::collections::HashMap;
use std::time::Instant;

/// One sampler per stream (network, disk). The first call seeds the
/// baseline and reports zero; later calls report the summed delta divided
/// by the elapsed time, clamped to at least one second.
#[derive(Debug, Default)]
pub struct RateSampler {
    last_counters: HashMap<String, (u64, u64)>,
    last_sampled_at: Option<Instant>,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `current` maps a device/interface name to its cumulative
    /// (outbound, inbound) byte counters. Returns (out_per_sec, in_per_sec).
    pub fn sample(&mut self, current: HashMap<String, (u64, u64)>) -> (f64, f64) {
        self.sample_at(current, Instant::now())
    }

    fn sample_at(&mut self, current: HashMap<String, (u64, u64)>, now: Instant) -> (f64, f64) {
        let (cur_out, cur_in) = sum_counters(&current);

        let Some(last_at) = self.last_sampled_at else {
            self.last_counters = current;
            self.last_sampled_at = Some(now);
            return (0.0, 0.0);
        };

        let (last_out, last_in) = sum_counters(&self.last_counters);
        let elapsed = now.duration_since(last_at).as_secs_f64().max(1.0);
        let out_rate = cur_out.saturating_sub(last_out) as f64 / elapsed;
        let in_rate = cur_in.saturating_sub(last_in) as f64 / elapsed;

        self.last_counters = current;
        self.last_sampled_at = Some(now);
        (out_rate, in_rate)
    }
}

fn sum_counters(counters: &HashMap<String, (u64, u64)>) -> (u64, u64) {
    counters.values().fold((0, 0), |(out_acc, in_acc), (o, i)| {
        (out_acc.saturating_add(*o), in_acc.saturating_add(*i))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn counters(pairs: &[(&str, u64, u64)]) -> HashMap<String, (u64, u64)> {
        pairs
            .iter()
            .map(|(n, o, i)| (n.to_string(), (*o, *i)))
            .collect()
    }

    #[test]
    fn first_sample_seeds_and_returns_zero() {
        let mut sampler = RateSampler::new();
        let rates = sampler.sample(counters(&[("eth0", 1000, 2000)]));
        assert_eq!(rates, (0.0, 0.0));
    }

    #[test]
    fn subsequent_samples_report_per_second_rates() {
        let mut sampler = RateSampler::new();
        let start = Instant::now();
        sampler.sample_at(counters(&[("eth0", 1000, 2000)]), start);
        let rates = sampler.sample_at(
            counters(&[("eth0", 3000, 6000)]),
            start + Duration::from_secs(2),
        );
        assert_eq!(rates, (1000.0, 2000.0));
    }

    #[test]
    fn elapsed_is_clamped_to_one_second() {
        let mut sampler = RateSampler::new();
        let start = Instant::now();
        sampler.sample_at(counters(&[("eth0", 0, 0)]), start);
        let rates = sampler.sample_at(
            counters(&[("eth0", 500, 700)]),
            start + Duration::from_millis(100),
        );
        assert_eq!(rates, (500.0, 700.0));
    }

    #[test]
    fn counter_reset_does_not_go_negative() {
        let mut sampler = RateSampler::new();
        let start = Instant::now();
        sampler.sample_at(counters(&[("eth0", 9000, 9000)]), start);
        let rates = sampler.sample_at(
            counters(&[("eth0", 10, 20)]),
            start + Duration::from_secs(1),
        );
        assert_eq!(rates, (0.0, 0.0));
    }

    #[test]
    fn interfaces_are_summed() {
        let mut sampler = RateSampler::new();
        let start = Instant::now();
        sampler.sample_at(counters(&[("eth0", 0, 0), ("wlan0", 0, 0)]), start);
        let rates = sampler.sample_at(
            counters(&[("eth0", 100, 200), ("wlan0", 300, 400)]),
            start + Duration::from_secs(1),
        );
        assert_eq!(rates, (400.0, 600.0));
    }
}

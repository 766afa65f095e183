pub mod collectors;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod supervisor;
pub mod transport;
pub mod updater;

#[cfg(test)]
mod tests {
    use crate::collectors::filter_partitions;
    use crate::collectors::probe::Partition;
    use crate::collectors::rates::RateSampler;
    use crate::crypto;
    use crate::supervisor::{next_backoff, INITIAL_BACKOFF, MAX_BACKOFF};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn arb_partition() -> impl Strategy<Value = Partition> {
        (
            prop::sample::select(vec!["sda1", "sda2", "sdb1"]),
            prop::sample::select(vec!["/", "/proc", "/proc/sys", "/data", "/data/sub"]),
            prop::sample::select(vec!["ext4", "tmpfs", "proc"]),
            0u64..4,
        )
            .prop_map(|(device, mount, fs, total)| Partition {
                device: device.into(),
                mount_point: mount.into(),
                fs_type: fs.into(),
                total,
                used: total / 2,
                free: total - total / 2,
                used_percent: if total == 0 { 0.0 } else { 50.0 },
            })
    }

    proptest! {
        #[test]
        fn backoff_is_monotone_until_saturation(steps in 1usize..24) {
            let mut delay = INITIAL_BACKOFF;
            let mut prev = delay;
            for _ in 0..steps {
                delay = next_backoff(delay);
                prop_assert!(delay >= prev);
                prop_assert!(delay <= MAX_BACKOFF);
                prev = delay;
            }
            if steps >= 6 {
                prop_assert_eq!(delay, MAX_BACKOFF);
            }
        }

        #[test]
        fn sampler_seeds_then_reports_exact_deltas(
            base_out in 0u64..1_000_000,
            base_in in 0u64..1_000_000,
            delta_out in 0u64..1_000_000,
            delta_in in 0u64..1_000_000,
        ) {
            let mut sampler = RateSampler::new();
            let counters = |o, i| {
                let mut m = HashMap::new();
                m.insert("eth0".to_string(), (o, i));
                m
            };
            prop_assert_eq!(sampler.sample(counters(base_out, base_in)), (0.0, 0.0));
            // Sub-second sampling clamps elapsed to 1s, so the rate equals
            // the raw delta and is never negative.
            let (out_rate, in_rate) =
                sampler.sample(counters(base_out + delta_out, base_in + delta_in));
            prop_assert_eq!(out_rate, delta_out as f64);
            prop_assert_eq!(in_rate, delta_in as f64);
        }

        #[test]
        fn partition_filter_is_idempotent(parts in prop::collection::vec(arb_partition(), 0..12)) {
            let excluded_mounts = vec!["/proc".to_string()];
            let excluded_fs = vec!["tmpfs".to_string()];
            let once = filter_partitions(parts, &excluded_mounts, &excluded_fs);
            let twice = filter_partitions(once.clone(), &excluded_mounts, &excluded_fs);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn aes_seal_open_is_identity(msg in prop::collection::vec(any::<u8>(), 0..512)) {
            let key = [0x5au8; 32];
            let sealed = crypto::aes_seal(&msg, &key).unwrap();
            prop_assert_eq!(crypto::aes_open(&sealed, &key).unwrap(), msg);
        }
    }
}

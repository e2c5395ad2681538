/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::Duration;

use super::flow_export_info::KernelCounters;
use super::kernel::{BYTES_COUNTER_BITS, PACKETS_COUNTER_BITS};

/// Delta of a `bits` wide counter between two readings.
///
/// A reading below the previous one is taken as exactly one wrap.
pub fn counter_delta(prev: u64, raw: u64, bits: u32) -> u64 {
    let max = if bits >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };
    let (prev, raw) = (prev & max, raw & max);
    if raw >= prev {
        raw - prev
    } else {
        (max - prev) + raw + 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub bytes: u64,
    pub packets: u64,
    // the reading was implausible and the delta was clamped to zero
    pub anomaly: bool,
}

impl Delta {
    pub fn is_zero(&self) -> bool {
        self.bytes == 0 && self.packets == 0
    }
}

/// Turns successive kernel readings into deltas.
#[derive(Clone, Debug, Default)]
pub struct DeltaEngine {
    // bytes per second
    link_capacity: Option<u64>,
}

impl DeltaEngine {
    pub fn new(link_capacity: Option<u64>) -> Self {
        Self { link_capacity }
    }

    pub fn set_link_capacity(&mut self, link_capacity: Option<u64>) {
        self.link_capacity = link_capacity;
    }

    // most a flow can carry in `elapsed`, never less than one second worth
    fn bound(&self, elapsed: Duration) -> Option<u64> {
        let capacity = self.link_capacity?;
        let millis = elapsed.as_millis().max(1000) as u64;
        Some(capacity.saturating_mul(millis) / 1000)
    }

    /// Computes the delta since `prev`, the raw reading itself for a first
    /// observation. `elapsed` is the time covered by the delta.
    pub fn compute_delta(
        &self,
        prev: Option<KernelCounters>,
        raw: KernelCounters,
        elapsed: Duration,
    ) -> Delta {
        let (bytes, packets) = match prev {
            Some(prev) => (
                counter_delta(prev.bytes, raw.bytes, BYTES_COUNTER_BITS),
                counter_delta(prev.packets, raw.packets, PACKETS_COUNTER_BITS),
            ),
            None => (raw.bytes, raw.packets),
        };
        match self.bound(elapsed) {
            Some(bound) if bytes > bound || packets > bound => Delta {
                anomaly: true,
                ..Default::default()
            },
            _ => Delta {
                bytes,
                packets,
                anomaly: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(bytes: u64, packets: u64) -> KernelCounters {
        KernelCounters { bytes, packets }
    }

    #[test]
    fn delta_without_wrap() {
        assert_eq!(counter_delta(100, 250, 48), 150);
        assert_eq!(counter_delta(7, 7, 48), 0);
    }

    #[test]
    fn delta_with_single_wrap() {
        // 8 bit counter, modulus 256
        assert_eq!(counter_delta(255 - 5, 3, 8), 9);
        let max = (1u64 << BYTES_COUNTER_BITS) - 1;
        assert_eq!(counter_delta(max - 5, 3, BYTES_COUNTER_BITS), 9);
        let max = (1u64 << PACKETS_COUNTER_BITS) - 1;
        assert_eq!(counter_delta(max, 0, PACKETS_COUNTER_BITS), 1);
        assert_eq!(counter_delta(u64::MAX, 0, 64), 1);
    }

    #[test]
    fn delta_is_never_negative() {
        let samples = [0u64, 1, 2, 1 << 20, (1 << 32) + 5, (1 << 48) - 1];
        for prev in samples {
            for raw in samples {
                let d = counter_delta(prev, raw, BYTES_COUNTER_BITS);
                assert!(d < 1 << BYTES_COUNTER_BITS);
                assert_eq!((prev + d) & ((1 << BYTES_COUNTER_BITS) - 1), raw);
            }
        }
    }

    #[test]
    fn first_observation_is_raw() {
        let engine = DeltaEngine::default();
        let d = engine.compute_delta(None, counters(500, 5), Duration::from_secs(1));
        assert_eq!((d.bytes, d.packets, d.anomaly), (500, 5, false));
    }

    #[test]
    fn implausible_delta_is_clamped() {
        let engine = DeltaEngine::new(Some(1000));
        let d = engine.compute_delta(
            Some(counters(0, 0)),
            counters(5000, 10),
            Duration::from_secs(2),
        );
        assert!(d.anomaly);
        assert!(d.is_zero());

        let d = engine.compute_delta(
            Some(counters(0, 0)),
            counters(1500, 10),
            Duration::from_secs(2),
        );
        assert!(!d.anomaly);
        assert_eq!(d.bytes, 1500);

        // short intervals still allow one second worth of traffic
        let d = engine.compute_delta(
            Some(counters(0, 0)),
            counters(900, 1),
            Duration::from_millis(100),
        );
        assert!(!d.anomaly);
    }
}

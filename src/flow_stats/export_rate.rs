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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use log::{debug, info};
use rand::prelude::{Rng, SeedableRng, SmallRng};

use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use super::flow_export_info::FlowExportInfo;
use crate::common::Timestamp;

pub const DEFAULT_FLOW_SAMPLING_THRESHOLD: u64 = 1;
const RATE_COMPUTE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct ExportRateCounter {
    pub exported: AtomicU64,
    pub drops: AtomicU64,
    pub threshold: AtomicU64,
    pub rate: AtomicU64,
}

impl RefCountable for ExportRateCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "exported",
                CounterType::Counted,
                CounterValue::Unsigned(self.exported.swap(0, Ordering::Relaxed)),
            ),
            (
                "flow_export_msg_drops",
                CounterType::Counted,
                CounterValue::Unsigned(self.drops.swap(0, Ordering::Relaxed)),
            ),
            (
                "sampling_threshold",
                CounterType::Gauged,
                CounterValue::Unsigned(self.threshold.load(Ordering::Relaxed)),
            ),
            (
                "flow_export_rate",
                CounterType::Gauged,
                CounterValue::Unsigned(self.rate.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// Adaptive sampler bounding the flow record export rate.
///
/// One in `threshold` eligible export attempts is let through. Every second
/// the achieved rate is compared with the target and the threshold scaled.
pub struct ExportRateController {
    threshold: u64,
    max_threshold: u64,
    // eligible attempts since the last sampled one
    sample_count: u64,

    flow_export_count: u64,
    flow_export_rate: u64,
    prev_flow_export_rate_compute_time: Option<Timestamp>,
    target_rate: u32,
    prev_cfg_flow_export_rate: u32,

    flow_export_msg_drops: u64,
    small_rng: SmallRng,
    counter: Arc<ExportRateCounter>,
}

impl ExportRateController {
    pub fn new(target_rate: u32, max_threshold: u64) -> Self {
        Self::with_rng(target_rate, max_threshold, SmallRng::from_entropy())
    }

    pub fn with_rng(target_rate: u32, max_threshold: u64, small_rng: SmallRng) -> Self {
        let counter = Arc::new(ExportRateCounter::default());
        counter
            .threshold
            .store(DEFAULT_FLOW_SAMPLING_THRESHOLD, Ordering::Relaxed);
        Self {
            threshold: DEFAULT_FLOW_SAMPLING_THRESHOLD,
            max_threshold: max_threshold.max(1),
            sample_count: 0,
            flow_export_count: 0,
            flow_export_rate: 0,
            prev_flow_export_rate_compute_time: None,
            target_rate,
            prev_cfg_flow_export_rate: target_rate,
            flow_export_msg_drops: 0,
            small_rng,
            counter,
        }
    }

    pub fn counter(&self) -> &Arc<ExportRateCounter> {
        &self.counter
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Achieved export rate of the last recompute interval.
    pub fn flow_export_rate(&self) -> u64 {
        self.flow_export_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn flow_export_msg_drops(&self) -> u64 {
        self.flow_export_msg_drops
    }

    pub fn set_target_rate(&mut self, target_rate: u32) {
        self.target_rate = target_rate;
    }

    pub fn set_max_threshold(&mut self, max_threshold: u64) {
        self.max_threshold = max_threshold.max(1);
        if self.threshold > self.max_threshold {
            self.set_threshold(self.max_threshold);
        }
    }

    /// Export disabled: only flows logged by policy go out.
    pub fn export_disabled(&self) -> bool {
        self.target_rate == 0
    }

    /// First and final records bypass sampling.
    pub fn is_guaranteed(info: &FlowExportInfo) -> bool {
        !info.exported || info.teardown_time.is_some()
    }

    /// Multiplier for the counters of a record that passed sampling.
    pub fn sampling_scale(&self, info: &FlowExportInfo) -> u64 {
        if info.is_action_log() || Self::is_guaranteed(info) {
            1
        } else {
            self.threshold
        }
    }

    pub fn should_export(&mut self, info: &FlowExportInfo, now: Timestamp) -> bool {
        self.update_flow_threshold(now);

        if info.is_action_log() {
            return true;
        }
        if self.export_disabled() {
            self.record_dropped(1);
            return false;
        }
        if Self::is_guaranteed(info) || self.threshold <= 1 {
            return true;
        }

        self.sample_count += 1;
        if self.sample_count >= self.threshold {
            self.sample_count = 0;
            true
        } else {
            self.record_dropped(1);
            false
        }
    }

    pub fn record_exported(&mut self, records: u64) {
        self.flow_export_count += records;
        self.counter.exported.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_dropped(&mut self, records: u64) {
        self.flow_export_msg_drops += records;
        self.counter.drops.fetch_add(records, Ordering::Relaxed);
    }

    /// Threshold to use given the achieved and target export rates.
    pub fn adjust_threshold(&self, observed_rate: u64, target_rate: u64) -> u64 {
        if target_rate == 0 {
            return self.threshold;
        }
        let ratio = observed_rate as f64 / target_rate as f64;
        let t = self.threshold;
        let new = if ratio > 3.0 {
            t.saturating_mul(4)
        } else if ratio > 2.0 {
            t.saturating_mul(3)
        } else if ratio > 1.25 {
            t.saturating_mul(2)
        } else if ratio < 0.8 {
            t / 2
        } else {
            t
        };
        new.clamp(1, self.max_threshold)
    }

    fn set_threshold(&mut self, threshold: u64) {
        self.threshold = threshold;
        // random phase so flows visited in the same order are not
        // sampled in lockstep
        self.sample_count = self.small_rng.gen_range(0..threshold);
        self.counter.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn update_flow_threshold(&mut self, now: Timestamp) {
        let Some(prev) = self.prev_flow_export_rate_compute_time else {
            self.prev_flow_export_rate_compute_time = Some(now);
            return;
        };

        let elapsed = now.saturating_elapsed(prev);
        let recomputed = elapsed >= RATE_COMPUTE_INTERVAL;
        if recomputed {
            self.flow_export_rate =
                (self.flow_export_count as f64 / elapsed.as_secs_f64()).round() as u64;
            self.counter
                .rate
                .store(self.flow_export_rate, Ordering::Relaxed);
            self.prev_flow_export_rate_compute_time = Some(now);
            self.flow_export_count = 0;
        }
        if !recomputed && self.target_rate == self.prev_cfg_flow_export_rate {
            return;
        }
        if self.target_rate != self.prev_cfg_flow_export_rate {
            info!(
                "flow export rate target updated from {} to {}",
                self.prev_cfg_flow_export_rate, self.target_rate
            );
            self.prev_cfg_flow_export_rate = self.target_rate;
        }
        if self.export_disabled() {
            return;
        }

        let new = self.adjust_threshold(self.flow_export_rate, self.target_rate as u64);
        if new != self.threshold {
            debug!(
                "flow sampling threshold {} -> {}, rate {} target {}",
                self.threshold, new, self.flow_export_rate, self.target_rate
            );
            self.set_threshold(new);
        }
    }
}

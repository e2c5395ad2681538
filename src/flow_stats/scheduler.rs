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

use log::info;

// age time the flow table size is dimensioned for
const DEFAULT_AGE_TIME_MS: u64 = 180_000;
const MIN_FLOWS_PER_PASS: usize = 100;

/// Size and spacing of the next collection pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassSchedule {
    pub flow_count: usize,
    pub interval: Duration,
}

/// Derives the pass size and interval from the number of tracked flows so
/// that every flow is visited several times within one age time.
///
/// The multiplier is the number of visits a flow gets per age time when the
/// flow table is full and passes run at the minimum interval. Fewer flows
/// spread the same visits over longer intervals, capped at the default one.
#[derive(Debug)]
pub struct PassScheduler {
    flow_table_size: usize,
    age_time: Duration,
    min_interval: Duration,
    multiplier: u64,
}

impl PassScheduler {
    pub fn new(flow_table_size: usize, age_time: Duration, min_interval: Duration) -> Self {
        let mut scheduler = Self {
            flow_table_size,
            age_time,
            min_interval,
            multiplier: 1,
        };
        scheduler.update_multiplier();
        scheduler
    }

    pub fn multiplier(&self) -> u64 {
        self.multiplier
    }

    fn age_ms(&self) -> u64 {
        (self.age_time.as_millis() as u64).max(1)
    }

    fn update_multiplier(&mut self) {
        let age_ms = self.age_ms();
        let max_flows = self.flow_table_size as u64 * age_ms / DEFAULT_AGE_TIME_MS;
        self.multiplier = (max_flows * self.min_interval.as_millis() as u64 / age_ms).max(1);
    }

    /// Recomputes the multiplier when one of its inputs changed.
    pub fn set_params(
        &mut self,
        flow_table_size: usize,
        age_time: Duration,
        min_interval: Duration,
    ) {
        if self.flow_table_size == flow_table_size
            && self.age_time == age_time
            && self.min_interval == min_interval
        {
            return;
        }
        self.flow_table_size = flow_table_size;
        self.age_time = age_time;
        self.min_interval = min_interval;
        self.update_multiplier();
        info!(
            "flow pass multiplier set to {}, age time {:?}",
            self.multiplier, self.age_time
        );
    }

    pub fn schedule(&self, flows: usize, default_interval: Duration) -> PassSchedule {
        if flows == 0 {
            return PassSchedule {
                flow_count: MIN_FLOWS_PER_PASS,
                interval: default_interval,
            };
        }
        let age_ms = self.age_ms();
        let flows = flows as u64;
        let interval_ms = (age_ms * self.multiplier / flows)
            .min(default_interval.as_millis() as u64)
            .max(self.min_interval.as_millis() as u64);
        let flow_count = ((interval_ms * flows / age_ms) as usize).max(MIN_FLOWS_PER_PASS);
        PassSchedule {
            flow_count,
            interval: Duration::from_millis(interval_ms),
        }
    }
}

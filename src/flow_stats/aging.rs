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

use super::delta::Delta;
use super::flow_export_info::{AgingState, FlowExportInfo, KernelCounters};
use super::kernel::BYTES_COUNTER_BITS;
use crate::common::{FlowFlags, FlowKey, TcpFlowFlags, Timestamp, IPPROTO_TCP};

/// Decides when idle flows are evicted.
#[derive(Clone, Debug)]
pub struct AgingPolicy {
    tcp_syn_age_time: Duration,
    delete_short_flow: bool,
}

impl AgingPolicy {
    pub fn new(tcp_syn_age_time: Duration, delete_short_flow: bool) -> Self {
        Self {
            tcp_syn_age_time,
            delete_short_flow,
        }
    }

    pub fn set_delete_short_flow(&mut self, delete_short_flow: bool) {
        self.delete_short_flow = delete_short_flow;
    }

    /// Advances the aging state with the delta observed this tick.
    pub fn observe(&self, info: &mut FlowExportInfo, delta: &Delta, now: Timestamp) {
        info.aging_state = match info.aging_state {
            AgingState::Active if delta.is_zero() => AgingState::Candidate { since: now },
            AgingState::Candidate { .. } if !delta.is_zero() => AgingState::Active,
            state => state,
        };
    }

    pub fn tcp_flow_should_be_aged(
        &self,
        key: &FlowKey,
        info: &FlowExportInfo,
        now: Timestamp,
    ) -> bool {
        if key.protocol != IPPROTO_TCP {
            return false;
        }
        if info.tcp_flags.intersects(TcpFlowFlags::CLOSED) {
            return true;
        }
        if info.tcp_flags.intersects(TcpFlowFlags::SYN_ANY)
            && !info.tcp_flags.intersects(TcpFlowFlags::ESTABLISHED_ANY)
        {
            return now.saturating_elapsed(info.setup_time) >= self.tcp_syn_age_time;
        }
        false
    }

    /// Whether an idle flow is due for eviction. Only `Candidate` flows are.
    ///
    /// Short flows and closed TCP sessions skip the age interval.
    pub fn should_age(
        &self,
        key: &FlowKey,
        info: &FlowExportInfo,
        now: Timestamp,
        age_interval: Duration,
    ) -> bool {
        let AgingState::Candidate { since } = info.aging_state else {
            return false;
        };
        if self.delete_short_flow && info.is_flags_set(FlowFlags::SHORT_FLOW) {
            return true;
        }
        if self.tcp_flow_should_be_aged(key, info, now) {
            return true;
        }
        now.saturating_elapsed(since) >= age_interval
            && now.saturating_elapsed(info.last_modified_time) >= age_interval
    }

    /// Like `should_age` for a flow not visited this tick, using a fresh
    /// kernel reading to check it is still idle.
    pub fn peer_should_age(
        &self,
        key: &FlowKey,
        info: &FlowExportInfo,
        reading: Option<KernelCounters>,
        now: Timestamp,
        age_interval: Duration,
    ) -> bool {
        if info.is_aged() {
            return true;
        }
        let mask = (1u64 << BYTES_COUNTER_BITS) - 1;
        if let (Some(reading), Some(last)) = (reading, info.last_kernel) {
            if reading.bytes & mask != last.bytes & mask {
                return false;
            }
        }
        self.should_age(key, info, now, age_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_stats::FlowMetadata;

    const AGE: Duration = Duration::from_secs(10);

    fn tcp_key() -> FlowKey {
        FlowKey {
            protocol: IPPROTO_TCP,
            ..Default::default()
        }
    }

    fn zero() -> Delta {
        Delta::default()
    }

    fn some() -> Delta {
        Delta {
            bytes: 1,
            packets: 1,
            anomaly: false,
        }
    }

    fn info_at(secs: u64) -> FlowExportInfo {
        FlowExportInfo::new(FlowMetadata::default(), Timestamp::from_secs(secs))
    }

    #[test]
    fn candidate_then_aged_after_interval() {
        let policy = AgingPolicy::new(Duration::from_secs(180), false);
        let key = FlowKey::default();
        let mut info = info_at(0);

        let t1 = Timestamp::from_secs(5);
        policy.observe(&mut info, &zero(), t1);
        assert_eq!(info.aging_state, AgingState::Candidate { since: t1 });
        assert!(!policy.should_age(&key, &info, t1, AGE));

        // candidate start is kept across idle ticks
        policy.observe(&mut info, &zero(), Timestamp::from_secs(9));
        assert_eq!(info.aging_state, AgingState::Candidate { since: t1 });
        assert!(!policy.should_age(&key, &info, Timestamp::from_secs(14), AGE));
        assert!(policy.should_age(&key, &info, Timestamp::from_secs(15), AGE));
    }

    #[test]
    fn traffic_resets_candidate() {
        let policy = AgingPolicy::new(Duration::from_secs(180), false);
        let mut info = info_at(0);
        policy.observe(&mut info, &zero(), Timestamp::from_secs(1));
        policy.observe(&mut info, &some(), Timestamp::from_secs(2));
        assert_eq!(info.aging_state, AgingState::Active);
        assert!(!policy.should_age(&FlowKey::default(), &info, Timestamp::from_secs(100), AGE));
    }

    #[test]
    fn short_flow_ages_on_first_idle_tick() {
        let mut policy = AgingPolicy::new(Duration::from_secs(180), true);
        let mut info = info_at(0);
        info.flags = FlowFlags::SHORT_FLOW;
        let now = Timestamp::from_secs(1);
        assert!(!policy.should_age(&FlowKey::default(), &info, now, AGE));
        policy.observe(&mut info, &zero(), now);
        assert!(policy.should_age(&FlowKey::default(), &info, now, AGE));

        policy.set_delete_short_flow(false);
        assert!(!policy.should_age(&FlowKey::default(), &info, now, AGE));
    }

    #[test]
    fn closed_tcp_ages_immediately() {
        let policy = AgingPolicy::new(Duration::from_secs(180), false);
        let mut info = info_at(0);
        info.tcp_flags = TcpFlowFlags::SYN | TcpFlowFlags::ESTABLISHED | TcpFlowFlags::RST;
        let now = Timestamp::from_secs(2);
        policy.observe(&mut info, &zero(), now);
        assert!(policy.should_age(&tcp_key(), &info, now, AGE));
        assert!(!policy.should_age(&FlowKey::default(), &info, now, AGE));
    }

    #[test]
    fn syn_timeout() {
        let policy = AgingPolicy::new(Duration::from_secs(30), false);
        let mut info = info_at(0);
        info.tcp_flags = TcpFlowFlags::SYN;
        assert!(!policy.tcp_flow_should_be_aged(&tcp_key(), &info, Timestamp::from_secs(29)));
        assert!(policy.tcp_flow_should_be_aged(&tcp_key(), &info, Timestamp::from_secs(30)));
        info.tcp_flags |= TcpFlowFlags::ESTABLISHED_R;
        assert!(!policy.tcp_flow_should_be_aged(&tcp_key(), &info, Timestamp::from_secs(300)));
    }

    #[test]
    fn peer_with_new_traffic_is_not_aged() {
        let policy = AgingPolicy::new(Duration::from_secs(180), false);
        let mut info = info_at(0);
        info.last_kernel = Some(KernelCounters {
            bytes: 100,
            packets: 1,
        });
        policy.observe(&mut info, &zero(), Timestamp::from_secs(1));
        let now = Timestamp::from_secs(20);
        let same = Some(KernelCounters {
            bytes: 100,
            packets: 1,
        });
        let more = Some(KernelCounters {
            bytes: 160,
            packets: 2,
        });
        assert!(policy.peer_should_age(&FlowKey::default(), &info, same, now, AGE));
        assert!(!policy.peer_should_age(&FlowKey::default(), &info, more, now, AGE));
    }
}

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

use std::collections::BTreeMap;
use std::iter;
use std::mem;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use arc_swap::access::Access;
use log::{debug, info, warn};

use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use public::queue::{self, Receiver, Sender};

use super::{
    aging::AgingPolicy,
    delta::{Delta, DeltaEngine},
    export::{build_records, FlowExportParams, FlowMsgBatch, FlowRecordSink, RevFlowParams},
    export_rate::{ExportRateController, ExportRateCounter},
    flow_export_info::{AgingState, FlowExportInfo, FlowMetadata, KernelCounters},
    flow_tree::FlowEntryTree,
    kernel::{KernelFlowStats, KernelFlowTable},
    request::{CollectorEnd, FlowExportReq, FlowExportResp},
    scheduler::PassScheduler,
    underlay::UnderlayResolver,
    vn_stats::{FipStats, InterVnStats, PortBitmaps},
    ANOMALY_RESYNC_THRESHOLD,
};
use crate::common::{FlowKey, Timestamp};
use crate::config::{FlowStatsAccess, FlowStatsConfig};

#[derive(Default)]
pub struct FlowStatsCounter {
    pub ticks: AtomicU64,
    pub visited: AtomicU64,
    pub exported: AtomicU64,
    pub requests: AtomicU64,
    pub kernel_read_errors: AtomicU64,
    pub counter_anomalies: AtomicU64,
    pub counter_resyncs: AtomicU64,
    pub aged: AtomicU64,
    pub evict_request_retries: AtomicU64,
    pub response_queue_full: AtomicU64,
    pub evicted: AtomicU64,
    pub evicted_retries: AtomicU64,
    pub unknown_deletes: AtomicU64,
    pub dispatch_drops: AtomicU64,
    pub invariant_violations: AtomicU64,

    pub flows: AtomicU64,
    pub pending_evictions: AtomicU64,
}

impl RefCountable for FlowStatsCounter {
    fn get_counters(&self) -> Vec<Counter> {
        let counted = |name, v: &AtomicU64| {
            (
                name,
                CounterType::Counted,
                CounterValue::Unsigned(v.swap(0, Ordering::Relaxed)),
            )
        };
        vec![
            counted("ticks", &self.ticks),
            counted("visited", &self.visited),
            counted("exported", &self.exported),
            counted("requests", &self.requests),
            counted("kernel_read_errors", &self.kernel_read_errors),
            counted("counter_anomalies", &self.counter_anomalies),
            counted("counter_resyncs", &self.counter_resyncs),
            counted("aged", &self.aged),
            counted("evict_request_retries", &self.evict_request_retries),
            counted("response_queue_full", &self.response_queue_full),
            counted("evicted", &self.evicted),
            counted("evicted_retries", &self.evicted_retries),
            counted("unknown_deletes", &self.unknown_deletes),
            counted("dispatch_drops", &self.dispatch_drops),
            counted("invariant_violations", &self.invariant_violations),
            (
                "flows",
                CounterType::Gauged,
                CounterValue::Unsigned(self.flows.load(Ordering::Relaxed)),
            ),
            (
                "pending_evictions",
                CounterType::Gauged,
                CounterValue::Unsigned(self.pending_evictions.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickResult {
    pub visited: usize,
    // records handed to the sink, two per local flow
    pub exported: usize,
    pub aged_out: usize,
    pub backlog: bool,
    pub next_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowStatsCollectionParams {
    pub flow_export_rate: u64,
    pub configured_flow_export_rate: u32,
    pub sampling_threshold: u64,
}

/// Reconciles kernel flow counters with the agent view of each flow.
///
/// Every call to [`run`](Self::run) drains a bounded batch of flow table
/// events, then visits at most `flow_count_per_pass` flows following the
/// walk cursor. A visited flow is read from the kernel, its delta folded
/// in, its aging state advanced, and a record exported subject to the
/// export rate controller.
///
/// A flow is only removed on `DeleteFlow`, after its final record was
/// handed to the sink.
pub struct FlowStatsCollector {
    config: FlowStatsAccess,

    flow_tree: FlowEntryTree,
    kernel: Box<dyn KernelFlowTable>,
    sink: Box<dyn FlowRecordSink>,

    requests: Receiver<FlowExportReq>,
    responses: Sender<FlowExportResp>,
    request_buf: Vec<FlowExportReq>,
    // removed flows whose `Evicted` the flow table has not acked, with the
    // last time it was sent
    pending_evictions: BTreeMap<FlowKey, Option<Timestamp>>,

    delta_engine: DeltaEngine,
    aging: AgingPolicy,
    rate_controller: ExportRateController,
    underlay: UnderlayResolver,
    msg_batch: FlowMsgBatch,
    scheduler: PassScheduler,

    inter_vn_stats: InterVnStats,
    fip_stats: FipStats,
    port_bitmaps: PortBitmaps,

    counter: Arc<FlowStatsCounter>,
}

impl FlowStatsCollector {
    pub fn new(
        config: FlowStatsAccess,
        kernel: Box<dyn KernelFlowTable>,
        sink: Box<dyn FlowRecordSink>,
        queues: CollectorEnd,
    ) -> Self {
        let conf = config.load();
        let collector = Self {
            flow_tree: FlowEntryTree::new(),
            kernel,
            sink,
            requests: queues.requests,
            responses: queues.responses,
            request_buf: Vec::with_capacity(conf.request_drain_per_pass),
            pending_evictions: BTreeMap::new(),
            delta_engine: DeltaEngine::new(conf.link_capacity),
            aging: AgingPolicy::new(conf.flow_tcp_syn_age_time, conf.delete_short_flow),
            rate_controller: ExportRateController::new(
                conf.flow_export_rate,
                conf.max_sampling_threshold,
            ),
            underlay: UnderlayResolver::new(conf.router_id),
            msg_batch: FlowMsgBatch::new(),
            scheduler: PassScheduler::new(
                conf.flow_table_size,
                conf.flow_age_time,
                conf.flow_stats_min_interval,
            ),
            inter_vn_stats: InterVnStats::new(),
            fip_stats: FipStats::new(),
            port_bitmaps: PortBitmaps::new(),
            counter: Arc::new(FlowStatsCounter::default()),
            config,
        };
        info!(
            "flow stats collector created, age time {:?}, export rate {}, {} flows per pass",
            conf.flow_age_time, conf.flow_export_rate, conf.flow_count_per_pass
        );
        collector
    }

    pub fn counter(&self) -> &Arc<FlowStatsCounter> {
        &self.counter
    }

    pub fn export_rate_counter(&self) -> &Arc<ExportRateCounter> {
        self.rate_controller.counter()
    }

    pub fn len(&self) -> usize {
        self.flow_tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flow_tree.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = (&FlowKey, &FlowExportInfo)> {
        self.flow_tree.iter()
    }

    pub fn fetch_record(&self, key: &FlowKey) -> Option<&FlowExportInfo> {
        self.flow_tree.get(key)
    }

    pub fn collection_params(&self) -> FlowStatsCollectionParams {
        FlowStatsCollectionParams {
            flow_export_rate: self.rate_controller.flow_export_rate(),
            configured_flow_export_rate: self.rate_controller.target_rate(),
            sampling_threshold: self.rate_controller.threshold(),
        }
    }

    pub fn inter_vn_stats(&self) -> &InterVnStats {
        &self.inter_vn_stats
    }

    pub fn fip_stats(&self) -> &FipStats {
        &self.fip_stats
    }

    pub fn port_bitmaps(&self) -> &PortBitmaps {
        &self.port_bitmaps
    }

    pub fn pending_evictions(&self) -> usize {
        self.pending_evictions.len()
    }

    fn apply_config(&mut self, config: &FlowStatsConfig) {
        self.rate_controller
            .set_target_rate(config.flow_export_rate);
        self.rate_controller
            .set_max_threshold(config.max_sampling_threshold);
        self.aging.set_delete_short_flow(config.delete_short_flow);
        self.delta_engine.set_link_capacity(config.link_capacity);
        self.underlay.set_router_id(config.router_id);
        self.scheduler.set_params(
            config.flow_table_size,
            config.flow_age_time,
            config.flow_stats_min_interval,
        );
    }

    /// Runs one collection pass at `now`.
    pub fn run(&mut self, now: Timestamp) -> TickResult {
        let config = self.config.load().clone();
        self.apply_config(&config);
        self.counter.ticks.fetch_add(1, Ordering::Relaxed);

        let mut result = TickResult::default();
        self.drain_requests(config.request_drain_per_pass, now, &mut result);
        self.redeliver_evictions(now, config.evict_retry_interval);

        let (budget, interval) = if config.adaptive_pass {
            let schedule = self
                .scheduler
                .schedule(self.flow_tree.len(), config.flow_stats_interval);
            (schedule.flow_count, Some(schedule.interval))
        } else {
            (config.flow_count_per_pass, None)
        };
        let pass = self.flow_tree.next_pass(budget);
        for key in pass.keys.iter() {
            self.visit(key, now, &config, &mut result);
        }
        self.dispatch_pending();

        let requests_pending = !self.requests.is_empty();
        result.backlog = pass.backlog || requests_pending;
        result.next_interval = match interval {
            // an unfinished walk is expected, only queued requests hurry it
            Some(_) if requests_pending => config.flow_stats_min_interval,
            Some(interval) => interval,
            None if result.backlog => config.flow_stats_min_interval,
            None => config.flow_stats_interval,
        };
        self.counter
            .visited
            .fetch_add(result.visited as u64, Ordering::Relaxed);
        self.counter
            .flows
            .store(self.flow_tree.len() as u64, Ordering::Relaxed);
        self.counter
            .pending_evictions
            .store(self.pending_evictions.len() as u64, Ordering::Relaxed);
        result
    }

    fn drain_requests(&mut self, max: usize, now: Timestamp, result: &mut TickResult) {
        let mut requests = mem::take(&mut self.request_buf);
        match self.requests.try_recv_n(max, &mut requests) {
            Ok(_) => (),
            Err(queue::Error::Terminated(..)) => {
                debug!("flow stats request queue terminated");
            }
            Err(e) => debug!("flow stats request queue: {:?}", e),
        }
        for req in requests.drain(..) {
            self.handle_request(req, now, result);
        }
        self.request_buf = requests;
    }

    fn handle_request(&mut self, req: FlowExportReq, now: Timestamp, result: &mut TickResult) {
        self.counter.requests.fetch_add(1, Ordering::Relaxed);
        match req {
            FlowExportReq::AddFlow {
                key,
                creation_time,
                metadata,
            } => self.add_flow(key, creation_time, metadata),
            FlowExportReq::DeleteFlow { key, time } => {
                result.exported += self.delete_flow(key, time, now);
            }
            FlowExportReq::UpdateFlowIndex { key, flow_handle } => {
                match self.flow_tree.get_mut(&key) {
                    Some(info) => info.set_flow_handle(flow_handle),
                    None => debug!("index update for unknown flow {}", key),
                }
            }
            FlowExportReq::EvictAck { key } => {
                if self.pending_evictions.remove(&key).is_none() {
                    debug!("evict ack for flow {} not pending", key);
                }
            }
        }
    }

    fn add_flow(&mut self, key: FlowKey, creation_time: Timestamp, metadata: FlowMetadata) {
        if let Some(info) = self.flow_tree.get_mut(&key) {
            info.apply_metadata(metadata);
            return;
        }
        // the identity is reused before the old flow's eviction was acked
        if self.pending_evictions.remove(&key).is_some() {
            debug!("flow {} added again, eviction of the old flow dropped", key);
        }
        let info = FlowExportInfo::new(metadata, creation_time);
        self.port_bitmaps.new_flow(&key, &info);
        self.flow_tree.insert(key, info);
    }

    // Returns the number of records exported for the flow.
    fn delete_flow(&mut self, key: FlowKey, time: Timestamp, now: Timestamp) -> usize {
        let Some(info) = self.flow_tree.get_mut(&key) else {
            warn!("delete for unknown flow {}", key);
            self.counter.unknown_deletes.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        info.set_teardown_time(time);

        let (delta, kernel_sport) = match self.kernel.read_kernel_counters(info.flow_handle) {
            Ok(stats) => (
                fold_counters(&self.delta_engine, &self.counter, &key, info, &stats, now)
                    .unwrap_or_default(),
                Some(stats.udp_src_port),
            ),
            Err(e) => {
                debug!("final kernel read of flow {} failed: {}", key, e);
                self.counter
                    .kernel_read_errors
                    .fetch_add(1, Ordering::Relaxed);
                (Delta::default(), None)
            }
        };
        self.inter_vn_stats.update(info, delta.bytes, delta.packets);
        self.fip_stats
            .update(&self.flow_tree, &key, delta.bytes, delta.packets);

        let exported = self.export_flow(&key, &delta, kernel_sport, now);
        self.dispatch_pending();

        if let Some(mut info) = self.flow_tree.remove(&key) {
            info.aging_state = AgingState::Removed;
            debug!(
                "flow {} removed, {} bytes {} packets",
                key, info.bytes, info.packets
            );
        }
        self.counter.evicted.fetch_add(1, Ordering::Relaxed);
        self.pending_evictions.insert(key, None);
        self.send_evicted(key, now);
        exported
    }

    fn send_evicted(&mut self, key: FlowKey, now: Timestamp) -> bool {
        match self.responses.send(FlowExportResp::Evicted { key }) {
            Ok(_) => {
                self.pending_evictions.insert(key, Some(now));
                true
            }
            Err(e) => {
                self.counter
                    .response_queue_full
                    .fetch_add(1, Ordering::Relaxed);
                debug!("notify evicted flow {} failed: {:?}", key, e);
                false
            }
        }
    }

    fn redeliver_evictions(&mut self, now: Timestamp, retry_interval: Duration) {
        let due: Vec<(FlowKey, bool)> = self
            .pending_evictions
            .iter()
            .filter_map(|(key, sent)| match sent {
                None => Some((*key, false)),
                Some(t) if now.saturating_elapsed(*t) >= retry_interval => Some((*key, true)),
                _ => None,
            })
            .collect();
        for (key, retry) in due {
            if !self.send_evicted(key, now) {
                break;
            }
            if retry {
                self.counter
                    .evicted_retries
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn send_delete_request(&self, key: FlowKey, delete_reverse: bool) -> bool {
        match self.responses.send(FlowExportResp::DeleteRequest {
            key,
            delete_reverse,
        }) {
            Ok(_) => true,
            Err(e) => {
                self.counter
                    .response_queue_full
                    .fetch_add(1, Ordering::Relaxed);
                debug!("delete request of flow {} deferred: {:?}", key, e);
                false
            }
        }
    }

    fn visit(
        &mut self,
        key: &FlowKey,
        now: Timestamp,
        config: &FlowStatsConfig,
        result: &mut TickResult,
    ) {
        let Some(info) = self.flow_tree.get_mut(key) else {
            return;
        };
        result.visited += 1;

        match info.aging_state {
            AgingState::Removed => {
                debug_assert!(false, "removed flow {} still in tree", key);
                warn!("removed flow {} still in tree, skipped", key);
                self.counter
                    .invariant_violations
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            AgingState::Aged { .. } => {
                self.retry_delete_request(key, now, config.evict_retry_interval);
                return;
            }
            _ => (),
        }

        let stats = match self.kernel.read_kernel_counters(info.flow_handle) {
            Ok(stats) => stats,
            Err(e) => {
                debug!("kernel read of flow {} failed: {}", key, e);
                self.counter
                    .kernel_read_errors
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let Some(delta) = fold_counters(&self.delta_engine, &self.counter, key, info, &stats, now)
        else {
            return;
        };
        self.aging.observe(info, &delta, now);
        self.inter_vn_stats.update(info, delta.bytes, delta.packets);
        let should_age = self.aging.should_age(key, info, now, config.flow_age_time);
        self.fip_stats
            .update(&self.flow_tree, key, delta.bytes, delta.packets);

        if should_age {
            if let Some(aged) = self.age_flow(key, now, config.flow_age_time) {
                result.aged_out += aged;
                return;
            }
        }

        let exported = self.flow_tree.get(key).map_or(true, |info| info.exported);
        if !delta.is_zero() || !exported {
            result.exported += self.export_flow(key, &delta, Some(stats.udp_src_port), now);
        }
    }

    // Marks the flow, and its reverse if that is idle too, aged and asks
    // the flow table to delete them. Returns the number of flows aged, or
    // None when the reverse flow is still active.
    fn age_flow(&mut self, key: &FlowKey, now: Timestamp, age_interval: Duration) -> Option<usize> {
        let rev_key = self
            .flow_tree
            .get(key)?
            .rev_flow_key
            .filter(|rk| rk != key && self.flow_tree.contains_key(rk));

        if let Some(rk) = rev_key.as_ref() {
            let rev = self.flow_tree.get(rk)?;
            let reading = self
                .kernel
                .read_kernel_counters(rev.flow_handle)
                .ok()
                .map(|s| KernelCounters {
                    bytes: s.bytes(),
                    packets: s.packets(),
                });
            if !self
                .aging
                .peer_should_age(rk, rev, reading, now, age_interval)
            {
                return None;
            }
        }

        let sent = self.send_delete_request(*key, rev_key.is_some());
        let mut aged = 0;
        for k in iter::once(*key).chain(rev_key) {
            let Some(info) = self.flow_tree.get_mut(&k) else {
                continue;
            };
            if info.is_aged() {
                continue;
            }
            info.aging_state = AgingState::Aged { at: now };
            info.set_teardown_time(now);
            info.evict_requested_at = if sent { Some(now) } else { None };
            debug!("flow {} aged out", k);
            aged += 1;
        }
        self.counter.aged.fetch_add(aged as u64, Ordering::Relaxed);
        Some(aged)
    }

    fn retry_delete_request(&mut self, key: &FlowKey, now: Timestamp, retry_interval: Duration) {
        let Some(info) = self.flow_tree.get(key) else {
            return;
        };
        let retry = match info.evict_requested_at {
            None => false,
            Some(t) if now.saturating_elapsed(t) >= retry_interval => true,
            Some(_) => return,
        };
        let delete_reverse = info
            .rev_flow_key
            .map_or(false, |rk| rk != *key && self.flow_tree.contains_key(&rk));
        if !self.send_delete_request(*key, delete_reverse) {
            return;
        }
        if retry {
            self.counter
                .evict_request_retries
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Some(info) = self.flow_tree.get_mut(key) {
            info.evict_requested_at = Some(now);
        }
    }

    // Formats and queues the records of one export if the rate controller
    // lets it through. Returns the number of records queued.
    fn export_flow(
        &mut self,
        key: &FlowKey,
        delta: &Delta,
        kernel_sport: Option<u16>,
        now: Timestamp,
    ) -> usize {
        let rev = self
            .flow_tree
            .get(key)
            .and_then(|info| info.rev_flow_key)
            .and_then(|rk| self.flow_tree.get(&rk).map(|ri| RevFlowParams::new(rk, ri)));
        let Some(info) = self.flow_tree.get_mut(key) else {
            return 0;
        };
        if !self.rate_controller.should_export(info, now) {
            return 0;
        }
        let scale = self.rate_controller.sampling_scale(info);
        let params = FlowExportParams {
            key: *key,
            diff_bytes: delta.bytes,
            diff_packets: delta.packets,
            kernel_sport,
            rev,
        };

        info.exported = true;
        let underlay = self
            .underlay
            .resolve_underlay(info, params.rev.as_ref(), kernel_sport);
        let records = build_records(info, &params, underlay, scale);

        let n = records.len();
        self.rate_controller.record_exported(n as u64);
        self.counter
            .exported
            .fetch_add(n as u64, Ordering::Relaxed);
        for record in records {
            if self.msg_batch.push(record) {
                self.dispatch_pending();
            }
        }
        n
    }

    fn dispatch_pending(&mut self) {
        let lost = self.msg_batch.dispatch_pending(self.sink.as_mut());
        if lost > 0 {
            self.rate_controller.record_dropped(lost as u64);
            self.counter
                .dispatch_drops
                .fetch_add(lost as u64, Ordering::Relaxed);
        }
    }
}

// Folds a kernel reading into `info`. Returns None when the reading is
// implausible and the flow should be left alone this tick.
fn fold_counters(
    engine: &DeltaEngine,
    counter: &FlowStatsCounter,
    key: &FlowKey,
    info: &mut FlowExportInfo,
    stats: &KernelFlowStats,
    now: Timestamp,
) -> Option<Delta> {
    let raw = KernelCounters {
        bytes: stats.bytes(),
        packets: stats.packets(),
    };
    let elapsed = now.saturating_elapsed(info.last_kernel_time.unwrap_or(info.setup_time));
    let delta = engine.compute_delta(info.last_kernel, raw, elapsed);
    info.tcp_flags = stats.tcp_flags;

    if delta.anomaly {
        counter.counter_anomalies.fetch_add(1, Ordering::Relaxed);
        info.anomaly_streak = info.anomaly_streak.saturating_add(1);
        if info.anomaly_streak < ANOMALY_RESYNC_THRESHOLD {
            debug!(
                "flow {} implausible counters {:?} after {:?}, ignored",
                key, raw, info.last_kernel
            );
            return None;
        }
        warn!(
            "flow {} counters resynchronised after {} implausible readings",
            key, info.anomaly_streak
        );
        counter.counter_resyncs.fetch_add(1, Ordering::Relaxed);
        info.last_kernel = Some(raw);
        info.last_kernel_time = Some(now);
        info.anomaly_streak = 0;
        return None;
    }

    info.anomaly_streak = 0;
    info.last_kernel = Some(raw);
    info.last_kernel_time = Some(now);
    if !delta.is_zero() {
        info.bytes = info.bytes.saturating_add(delta.bytes);
        info.packets = info.packets.saturating_add(delta.packets);
        info.last_modified_time = now;
    }
    Some(delta)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use uuid::Uuid;

    use public::queue::bounded;

    use super::*;
    use crate::common::{FlowFlags, TcpFlowFlags, TrafficAction, IPPROTO_TCP, IPPROTO_UDP};
    use crate::config::{Config, ConfigHandler, RuntimeConfig};
    use crate::flow_stats::{
        flow_stats_channels, FlowRecord, FlowTableEnd, MemoryKernelTable, QueueSink, VnFlowStats,
    };

    struct Harness {
        _handler: ConfigHandler,
        collector: FlowStatsCollector,
        kernel: Arc<MemoryKernelTable>,
        flow_table: FlowTableEnd,
        records: Receiver<FlowRecord>,
    }

    impl Harness {
        fn new(config: Config, response_queue_size: usize) -> Self {
            let handler = ConfigHandler::new(config).unwrap();
            let kernel = Arc::new(MemoryKernelTable::new());
            let (flow_table, collector_end, _) = flow_stats_channels(64, response_queue_size);
            let (sender, records, _) = bounded(1024);
            let collector = FlowStatsCollector::new(
                handler.flow_stats(),
                Box::new(kernel.clone()),
                Box::new(QueueSink::new(sender)),
                collector_end,
            );
            Self {
                _handler: handler,
                collector,
                kernel,
                flow_table,
                records,
            }
        }

        fn add(&self, key: FlowKey, handle: u32, metadata: FlowMetadata) {
            self.kernel.set_counters(handle, 0, 0);
            self.flow_table
                .events
                .on_flow_add(
                    key,
                    Timestamp::ZERO,
                    FlowMetadata {
                        flow_uuid: Uuid::new_v4(),
                        flow_handle: handle,
                        source_vn: "vn1".to_owned(),
                        dest_vn: "vn2".to_owned(),
                        ..metadata
                    },
                )
                .unwrap();
        }

        fn run(&mut self, secs: u64) -> TickResult {
            self.collector.run(Timestamp::from_secs(secs))
        }

        fn responses(&self) -> Vec<FlowExportResp> {
            let mut v = vec![];
            while let Ok(Some(r)) = self.flow_table.responses.try_recv() {
                v.push(r);
            }
            v
        }

        fn records(&self) -> Vec<FlowRecord> {
            let mut v = vec![];
            while let Ok(Some(r)) = self.records.try_recv() {
                v.push(r);
            }
            v
        }
    }

    fn config(flow_cache_timeout: u32) -> Config {
        Config {
            runtime: RuntimeConfig {
                flow_cache_timeout,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn key(port: u16) -> FlowKey {
        FlowKey {
            nh: 1,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            protocol: IPPROTO_UDP,
            src_port: port,
            dst_port: 53,
        }
    }

    fn reverse(key: FlowKey) -> FlowKey {
        FlowKey {
            src_addr: key.dst_addr,
            dst_addr: key.src_addr,
            src_port: key.dst_port,
            dst_port: key.src_port,
            ..key
        }
    }

    #[test]
    fn wrapped_counter_is_folded() {
        let mut h = Harness::new(config(180), 64);
        h.add(key(1000), 1, FlowMetadata::default());
        h.kernel.set_counters(1, (1 << 48) - 10, 5);
        h.run(1);
        h.kernel.set_counters(1, 20, 6);
        h.run(2);

        let info = h.collector.fetch_record(&key(1000)).unwrap();
        assert_eq!(info.bytes, (1 << 48) + 20);
        assert_eq!(info.packets, 6);
    }

    #[test]
    fn implausible_reading_resyncs() {
        let mut cfg = config(180);
        cfg.flow_stats.link_capacity = 1000;
        let mut h = Harness::new(cfg, 64);
        h.add(key(1000), 1, FlowMetadata::default());
        h.run(1);

        h.kernel.set_counters(1, 1_000_000, 10);
        for t in 2..=4 {
            h.run(t);
            assert_eq!(h.collector.fetch_record(&key(1000)).unwrap().bytes, 0);
        }
        let counter = h.collector.counter().clone();
        assert_eq!(counter.counter_anomalies.load(Ordering::Relaxed), 3);
        assert_eq!(counter.counter_resyncs.load(Ordering::Relaxed), 1);

        h.kernel.add_traffic(1, 500, 1);
        h.run(5);
        let info = h.collector.fetch_record(&key(1000)).unwrap();
        assert_eq!(info.bytes, 500);
        assert_eq!(info.aging_state, AgingState::Active);
    }

    #[test]
    fn readd_replaces_metadata_only() {
        let mut h = Harness::new(config(180), 64);
        h.add(key(1000), 1, FlowMetadata::default());
        h.kernel.add_traffic(1, 100, 1);
        h.run(1);

        h.flow_table
            .events
            .on_flow_add(
                key(1000),
                Timestamp::from_secs(1),
                FlowMetadata {
                    flow_handle: 1,
                    dest_vn: "vn3".to_owned(),
                    ..Default::default()
                },
            )
            .unwrap();
        h.kernel.add_traffic(1, 50, 1);
        h.run(2);

        let info = h.collector.fetch_record(&key(1000)).unwrap();
        assert_eq!(info.bytes, 150);
        assert_eq!(info.setup_time, Timestamp::ZERO);
        assert_eq!(info.dest_vn, "vn3");
        assert!(h.collector.port_bitmaps().vn("vn2").is_some());
        assert!(h.collector.port_bitmaps().vn("vn3").is_none());
    }

    #[test]
    fn index_update_restarts_delta() {
        let mut h = Harness::new(config(180), 64);
        h.add(key(1000), 1, FlowMetadata::default());
        h.kernel.add_traffic(1, 100, 1);
        h.run(1);

        h.kernel.set_counters(2, 40, 1);
        h.flow_table
            .events
            .on_flow_index_update(key(1000), 2)
            .unwrap();
        h.run(2);

        let info = h.collector.fetch_record(&key(1000)).unwrap();
        assert_eq!(info.flow_handle, 2);
        assert_eq!(info.bytes, 140);
    }

    #[test]
    fn pairwise_aging_waits_for_reverse() {
        let mut h = Harness::new(config(3), 64);
        let fwd = key(1000);
        let rev = reverse(fwd);
        h.add(
            fwd,
            1,
            FlowMetadata {
                rev_flow_key: Some(rev),
                flags: FlowFlags::INGRESS_DIR,
                ..Default::default()
            },
        );
        h.add(
            rev,
            2,
            FlowMetadata {
                rev_flow_key: Some(fwd),
                flags: FlowFlags::REVERSE_FLOW,
                ..Default::default()
            },
        );

        for t in 1..=7 {
            if (2..=4).contains(&t) {
                h.kernel.add_traffic(2, 10, 1);
            }
            let result = h.run(t);
            assert_eq!(result.aged_out, 0, "tick {}", t);
        }
        assert!(h.responses().is_empty());

        let result = h.run(8);
        assert_eq!(result.aged_out, 2);
        assert_eq!(
            h.responses(),
            vec![FlowExportResp::DeleteRequest {
                key: fwd,
                delete_reverse: true
            }]
        );
        assert!(h.collector.fetch_record(&fwd).unwrap().is_aged());
        assert!(h.collector.fetch_record(&rev).unwrap().is_aged());
        assert_eq!(
            h.collector.fetch_record(&rev).unwrap().teardown_time,
            Some(Timestamp::from_secs(8))
        );
    }

    #[test]
    fn closed_tcp_flow_skips_age_interval() {
        let mut h = Harness::new(config(180), 64);
        let k = FlowKey {
            protocol: IPPROTO_TCP,
            ..key(1000)
        };
        h.add(k, 1, FlowMetadata::default());
        h.kernel
            .update(1, |s| s.tcp_flags = TcpFlowFlags::SYN | TcpFlowFlags::RST);

        let result = h.run(1);
        assert_eq!(result.aged_out, 1);
        assert_eq!(
            h.responses(),
            vec![FlowExportResp::DeleteRequest {
                key: k,
                delete_reverse: false
            }]
        );
    }

    #[test]
    fn delete_request_redelivered() {
        let mut h = Harness::new(config(3), 1);
        h.add(key(1000), 1, FlowMetadata::default());
        h.run(1);
        assert_eq!(h.run(4).aged_out, 1);

        for t in 5..=8 {
            h.run(t);
        }
        // the first request was never read, redelivery finds the queue full
        h.run(9);
        let counter = h.collector.counter().clone();
        assert_eq!(counter.response_queue_full.load(Ordering::Relaxed), 1);
        assert_eq!(counter.evict_request_retries.load(Ordering::Relaxed), 0);

        assert_eq!(h.responses().len(), 1);
        h.run(10);
        assert_eq!(counter.evict_request_retries.load(Ordering::Relaxed), 1);
        assert_eq!(
            h.responses(),
            vec![FlowExportResp::DeleteRequest {
                key: key(1000),
                delete_reverse: false
            }]
        );
    }

    #[test]
    fn delete_exports_final_record_and_waits_for_ack() {
        let mut h = Harness::new(config(180), 64);
        h.add(key(1000), 1, FlowMetadata::default());
        h.kernel.add_traffic(1, 100, 1);
        h.run(1);
        assert_eq!(h.records().len(), 1);

        h.kernel.add_traffic(1, 50, 1);
        h.flow_table
            .events
            .on_flow_delete(key(1000), Timestamp::from_secs(2))
            .unwrap();
        let result = h.run(2);
        assert_eq!(result.exported, 1);
        assert_eq!(result.visited, 0);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].teardown_time, Some(Timestamp::from_secs(2)));
        assert_eq!(records[0].bytes, 150);
        assert_eq!(records[0].diff_bytes, 50);
        assert!(h.collector.fetch_record(&key(1000)).is_none());
        assert_eq!(
            h.responses(),
            vec![FlowExportResp::Evicted { key: key(1000) }]
        );

        h.run(7);
        assert_eq!(
            h.responses(),
            vec![FlowExportResp::Evicted { key: key(1000) }]
        );
        assert_eq!(
            h.collector.counter().evicted_retries.load(Ordering::Relaxed),
            1
        );

        h.flow_table.events.evict_ack(key(1000)).unwrap();
        h.run(8);
        assert_eq!(h.collector.pending_evictions(), 0);
        h.run(20);
        assert!(h.responses().is_empty());
    }

    #[test]
    fn readded_flow_cancels_pending_eviction() {
        let mut h = Harness::new(config(180), 64);
        h.add(key(1000), 1, FlowMetadata::default());
        h.run(1);
        h.flow_table
            .events
            .on_flow_delete(key(1000), Timestamp::from_secs(2))
            .unwrap();
        h.run(2);
        assert_eq!(
            h.responses(),
            vec![FlowExportResp::Evicted { key: key(1000) }]
        );
        assert_eq!(h.collector.pending_evictions(), 1);

        // same identity comes back before the flow table acked the eviction
        h.add(key(1000), 2, FlowMetadata::default());
        h.run(3);
        assert_eq!(h.collector.pending_evictions(), 0);

        h.run(8);
        h.run(20);
        assert!(h.responses().is_empty());
        assert_eq!(
            h.collector.counter().evicted_retries.load(Ordering::Relaxed),
            0
        );

        // a late ack of the old flow leaves the new one alone
        h.flow_table.events.evict_ack(key(1000)).unwrap();
        h.run(21);
        assert_eq!(h.collector.fetch_record(&key(1000)).unwrap().flow_handle, 2);
        assert!(h.responses().is_empty());
    }

    #[test]
    fn unknown_delete_is_counted() {
        let mut h = Harness::new(config(180), 64);
        h.flow_table
            .events
            .on_flow_delete(key(1), Timestamp::from_secs(1))
            .unwrap();
        h.run(1);
        assert_eq!(
            h.collector.counter().unknown_deletes.load(Ordering::Relaxed),
            1
        );
        assert!(h.responses().is_empty());
    }

    #[test]
    fn backlog_shortens_interval() {
        let mut cfg = config(180);
        cfg.runtime.flow_count_per_pass = 2;
        let mut h = Harness::new(cfg, 64);
        for port in 1..=3 {
            h.add(key(port), port as u32, FlowMetadata::default());
        }

        let result = h.run(1);
        assert_eq!(result.visited, 2);
        assert!(result.backlog);
        assert_eq!(result.next_interval, Duration::from_millis(100));

        let result = h.run(2);
        assert_eq!(result.visited, 1);
        assert!(!result.backlog);
        assert_eq!(result.next_interval, Duration::from_secs(1));
    }

    #[test]
    fn export_disabled_keeps_logged_flows() {
        let mut cfg = config(180);
        cfg.runtime.flow_export_rate = 0;
        let mut h = Harness::new(cfg, 64);
        h.add(key(1), 1, FlowMetadata::default());
        h.add(
            key(2),
            2,
            FlowMetadata {
                action: TrafficAction::PASS | TrafficAction::LOG,
                ..Default::default()
            },
        );

        let result = h.run(1);
        assert_eq!(result.exported, 1);
        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sport, 2);
        assert_eq!(records[0].action, "log|pass");
        assert_eq!(h.collector.export_rate_counter().drops.load(Ordering::Relaxed), 1);

        h.flow_table
            .events
            .on_flow_delete(key(1), Timestamp::from_secs(2))
            .unwrap();
        h.run(2);
        assert!(h.records().is_empty());
        assert!(h.collector.fetch_record(&key(1)).is_none());
        assert_eq!(h.responses(), vec![FlowExportResp::Evicted { key: key(1) }]);
    }

    #[test]
    fn local_flow_counts_two_records() {
        let mut h = Harness::new(config(180), 64);
        let egress_uuid = Uuid::new_v4();
        h.add(
            key(1),
            1,
            FlowMetadata {
                flags: FlowFlags::LOCAL_FLOW,
                egress_uuid,
                ..Default::default()
            },
        );
        h.kernel.add_traffic(1, 64, 1);

        let result = h.run(1);
        assert_eq!(result.exported, 2);
        let records = h.records();
        assert_eq!(records[1].flowuuid, egress_uuid);
        assert_eq!(records[1].underlay.source_port, 0);
        assert!(!h.collector.fetch_record(&key(1)).unwrap().underlay_sport_exported);
        assert_eq!(
            h.collector
                .inter_vn_stats()
                .get("vn2", "vn1")
                .map(|s| s.out_bytes),
            Some(64)
        );
    }

    #[test]
    fn fip_flow_counts_on_interface() {
        let mut h = Harness::new(config(180), 64);
        let fip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let fip_vmi = Uuid::new_v4();
        h.add(
            key(1),
            1,
            FlowMetadata {
                flags: FlowFlags::INGRESS_DIR,
                fip: Some(fip),
                fip_vmi,
                vm_name: "vm-a".to_owned(),
                ..Default::default()
            },
        );
        h.kernel.add_traffic(1, 100, 2);
        h.run(1);

        h.kernel.add_traffic(1, 50, 1);
        h.flow_table
            .events
            .on_flow_delete(key(1), Timestamp::from_secs(2))
            .unwrap();
        h.run(2);
        assert_eq!(
            h.collector.fip_stats().get(fip_vmi, fip, "vn1"),
            Some(&VnFlowStats {
                in_bytes: 150,
                in_packets: 3,
                ..Default::default()
            })
        );
        assert!(h.collector.port_bitmaps().vm("vm-a").is_some());
    }

    #[test]
    fn adaptive_pass_sizes_from_flow_count() {
        // one second age time over a small table gives a multiplier of 1
        let mut cfg = config(1);
        cfg.runtime.flow_count_per_pass = 2;
        cfg.flow_stats.adaptive_pass = true;
        cfg.flow_stats.flow_table_size = 1800;
        cfg.flow_stats.request_drain_per_pass = 2;
        let mut h = Harness::new(cfg, 64);
        for port in 1..=3 {
            h.add(key(port), port as u32, FlowMetadata::default());
        }

        let result = h.run(1);
        assert_eq!(result.visited, 2);
        assert!(result.backlog);
        assert_eq!(result.next_interval, Duration::from_millis(100));

        let result = h.run(1);
        assert_eq!(result.visited, 3);
        assert!(!result.backlog);
        assert_eq!(result.next_interval, Duration::from_millis(333));
    }
}

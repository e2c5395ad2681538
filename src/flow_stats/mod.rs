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

mod aging;
mod collector;
mod delta;
mod error;
mod export;
mod export_rate;
mod flow_export_info;
mod flow_tree;
mod kernel;
mod request;
mod scheduler;
mod thread;
mod underlay;
mod vn_stats;

pub use aging::AgingPolicy;
pub use collector::{
    FlowStatsCollectionParams, FlowStatsCollector, FlowStatsCounter, TickResult,
};
pub use delta::{counter_delta, Delta, DeltaEngine};
pub use error::{Error, ExportError, KernelError, Result};
pub use export::{
    build_records, FlowDirection, FlowExportParams, FlowMsgBatch, FlowRecord, FlowRecordSink,
    LogSink, QueueSink, RevFlowParams,
};
pub use export_rate::{ExportRateController, ExportRateCounter, DEFAULT_FLOW_SAMPLING_THRESHOLD};
pub use flow_export_info::{AgingState, FlowExportInfo, FlowMetadata, KernelCounters};
pub use flow_tree::{FlowEntryTree, Pass};
pub use kernel::{
    KernelFlowStats, KernelFlowTable, MemoryKernelTable, BYTES_COUNTER_BITS,
    PACKETS_COUNTER_BITS,
};
pub use request::{
    flow_stats_channels, CollectorEnd, FlowEventSender, FlowExportReq, FlowExportResp,
    FlowTableEnd, QueueStats,
};
pub use scheduler::{PassSchedule, PassScheduler};
pub use thread::FlowStatsCollectorThread;
pub use underlay::{UnderlayMeta, UnderlayResolver};
pub use vn_stats::{
    FipStats, FipStatsKey, InterVnStats, L4PortBitmap, PortBitmaps, VnFlowStats, UNKNOWN_VN,
};

pub const FLOW_COUNT_PER_PASS: usize = 200;
pub const MAX_FLOW_MSGS_PER_SEND: usize = 16;
// consecutive implausible readings before the reference is resynchronised
pub const ANOMALY_RESYNC_THRESHOLD: u8 = 3;

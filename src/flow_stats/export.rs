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

use std::net::IpAddr;

use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use public::queue::{self, Sender};

use super::error::ExportError;
use super::flow_export_info::FlowExportInfo;
use super::underlay::UnderlayMeta;
use super::MAX_FLOW_MSGS_PER_SEND;
use crate::common::{FlowFlags, FlowKey, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Ingress,
    Egress,
}

/// One exported flow record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlowRecord {
    pub flowuuid: Uuid,
    pub direction: FlowDirection,
    pub sourceip: IpAddr,
    pub destip: IpAddr,
    pub protocol: u8,
    pub sport: u16,
    pub dport: u16,
    pub nh: u32,
    pub sourcevn: String,
    pub destvn: String,
    pub setup_time: Timestamp,
    pub teardown_time: Option<Timestamp>,
    pub bytes: u64,
    pub packets: u64,
    pub diff_bytes: u64,
    pub diff_packets: u64,
    pub action: String,
    pub sg_rule_uuid: String,
    pub nw_ace_uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vmi_uuid: String,
    pub vm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_uuid: Option<Uuid>,
    pub tcp_flags: u16,
    #[serde(flatten)]
    pub underlay: UnderlayMeta,
}

/// Snapshot of the reverse flow taken before formatting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevFlowParams {
    pub key: FlowKey,
    pub flow_uuid: Uuid,
    pub peer_vrouter: String,
    pub exported: bool,
}

impl RevFlowParams {
    pub fn new(key: FlowKey, info: &FlowExportInfo) -> Self {
        Self {
            key,
            flow_uuid: info.flow_uuid,
            peer_vrouter: info.peer_vrouter.clone(),
            exported: info.exported,
        }
    }
}

/// Inputs of one export of a flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowExportParams {
    pub key: FlowKey,
    pub diff_bytes: u64,
    pub diff_packets: u64,
    pub kernel_sport: Option<u16>,
    pub rev: Option<RevFlowParams>,
}

impl FlowExportParams {
    /// Source address to report. Ingress NAT flows report the translated
    /// address seen as destination of the reverse flow.
    fn source_ip(&self, info: &FlowExportInfo) -> IpAddr {
        match self.rev.as_ref() {
            Some(rev)
                if info.is_flags_set(FlowFlags::NAT_FLOW | FlowFlags::INGRESS_DIR)
                    && rev.key.dst_addr != self.key.src_addr =>
            {
                rev.key.dst_addr
            }
            _ => self.key.src_addr,
        }
    }
}

/// Formats the records of one export, two for flows local to this host.
///
/// `scale` compensates counters of a sampled export for the skipped ones.
pub fn build_records(
    info: &FlowExportInfo,
    params: &FlowExportParams,
    underlay: UnderlayMeta,
    scale: u64,
) -> Vec<FlowRecord> {
    let key = &params.key;
    let record = FlowRecord {
        flowuuid: info.flow_uuid,
        direction: if info.is_ingress() || info.is_local() {
            FlowDirection::Ingress
        } else {
            FlowDirection::Egress
        },
        sourceip: if info.is_ingress() || info.is_local() {
            params.source_ip(info)
        } else {
            key.src_addr
        },
        destip: key.dst_addr,
        protocol: key.protocol,
        sport: key.src_port,
        dport: key.dst_port,
        nh: key.nh,
        sourcevn: info.source_vn.clone(),
        destvn: info.dest_vn.clone(),
        setup_time: info.setup_time,
        teardown_time: info.teardown_time,
        bytes: info.bytes,
        packets: info.packets,
        diff_bytes: params.diff_bytes.saturating_mul(scale),
        diff_packets: params.diff_packets.saturating_mul(scale),
        action: info.action.to_string(),
        sg_rule_uuid: info.sg_rule_uuid.clone(),
        nw_ace_uuid: info.nw_ace_uuid.clone(),
        vmi_uuid: info.vmi_uuid.clone(),
        vm: info.vm_name.clone(),
        drop_reason: info.drop_reason.map(|r| r.to_string()),
        reverse_uuid: params.rev.as_ref().map(|r| r.flow_uuid),
        tcp_flags: info.tcp_flags.bits(),
        underlay,
    };

    if info.is_local() {
        let egress = FlowRecord {
            flowuuid: info.egress_uuid,
            direction: FlowDirection::Egress,
            ..record.clone()
        };
        vec![record, egress]
    } else {
        vec![record]
    }
}

/// Destination of flow records.
pub trait FlowRecordSink: Send {
    /// Hands records over in order. On failure the undelivered records,
    /// the failing one first, are left in `records`.
    fn dispatch(&mut self, records: &mut Vec<FlowRecord>) -> Result<(), ExportError>;
}

/// Sends records into a bounded queue consumed by an uploader.
pub struct QueueSink {
    sender: Sender<FlowRecord>,
}

impl QueueSink {
    pub fn new(sender: Sender<FlowRecord>) -> Self {
        Self { sender }
    }
}

impl FlowRecordSink for QueueSink {
    fn dispatch(&mut self, records: &mut Vec<FlowRecord>) -> Result<(), ExportError> {
        match self.sender.send_all(records) {
            Ok(_) => Ok(()),
            Err(queue::Error::Full(r)) => {
                records.insert(0, r);
                Err(ExportError::SinkUnavailable)
            }
            Err(queue::Error::Terminated(r, _)) => {
                if let Some(r) = r {
                    records.insert(0, r);
                }
                Err(ExportError::Terminated)
            }
            Err(queue::Error::Timeout) => Err(ExportError::SinkUnavailable),
        }
    }
}

/// Writes records as json lines to the `flow_log` log target.
#[derive(Default)]
pub struct LogSink;

impl FlowRecordSink for LogSink {
    fn dispatch(&mut self, records: &mut Vec<FlowRecord>) -> Result<(), ExportError> {
        for record in records.drain(..) {
            match serde_json::to_string(&record) {
                Ok(line) => info!(target: "flow_log", "{}", line),
                Err(e) => warn!("flow record {} encode failed: {}", record.flowuuid, e),
            }
        }
        Ok(())
    }
}

/// Records waiting to be handed to the sink.
#[derive(Default)]
pub struct FlowMsgBatch {
    pending: Vec<FlowRecord>,
}

impl FlowMsgBatch {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(MAX_FLOW_MSGS_PER_SEND),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queues a record, returns true when the batch should be sent.
    pub fn push(&mut self, record: FlowRecord) -> bool {
        self.pending.push(record);
        self.pending.len() >= MAX_FLOW_MSGS_PER_SEND
    }

    /// Dispatches everything pending, returns the number of records lost.
    pub fn dispatch_pending(&mut self, sink: &mut dyn FlowRecordSink) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let total = self.pending.len();
        let lost = match sink.dispatch(&mut self.pending) {
            Ok(_) => 0,
            Err(e) => {
                debug!(
                    "dispatch flow records failed: {}, {} of {} dropped",
                    e,
                    self.pending.len(),
                    total
                );
                self.pending.len()
            }
        };
        self.pending.clear();
        lost
    }
}

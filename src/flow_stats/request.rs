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

use log::debug;

use public::queue::{self, bounded, Receiver, Sender, StatsHandle};

use super::error::{Error, Result};
use super::flow_export_info::FlowMetadata;
use crate::common::{FlowKey, Timestamp};

/// Events from the flow table to the collector.
#[derive(Clone, Debug, PartialEq)]
pub enum FlowExportReq {
    AddFlow {
        key: FlowKey,
        creation_time: Timestamp,
        metadata: FlowMetadata,
    },
    DeleteFlow {
        key: FlowKey,
        time: Timestamp,
    },
    UpdateFlowIndex {
        key: FlowKey,
        flow_handle: u32,
    },
    // the flow table has seen `Evicted` for `key`
    EvictAck {
        key: FlowKey,
    },
}

/// Notifications from the collector to the flow table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowExportResp {
    /// The flow aged out, delete it (and its reverse) from the flow table.
    DeleteRequest { key: FlowKey, delete_reverse: bool },
    /// The final record of the flow was dispatched, its resources may go.
    Evicted { key: FlowKey },
}

/// Producer handle used by the flow table. Never blocks.
#[derive(Clone)]
pub struct FlowEventSender {
    sender: Sender<FlowExportReq>,
}

impl FlowEventSender {
    fn send(&self, req: FlowExportReq) -> Result<()> {
        self.sender.send(req).map_err(|e| match e {
            queue::Error::Full(req) => {
                debug!("flow stats request queue full, rejected {:?}", req);
                Error::QueueFull
            }
            _ => Error::QueueTerminated,
        })
    }

    pub fn on_flow_add(
        &self,
        key: FlowKey,
        creation_time: Timestamp,
        metadata: FlowMetadata,
    ) -> Result<()> {
        self.send(FlowExportReq::AddFlow {
            key,
            creation_time,
            metadata,
        })
    }

    pub fn on_flow_delete(&self, key: FlowKey, time: Timestamp) -> Result<()> {
        self.send(FlowExportReq::DeleteFlow { key, time })
    }

    pub fn on_flow_index_update(&self, key: FlowKey, flow_handle: u32) -> Result<()> {
        self.send(FlowExportReq::UpdateFlowIndex { key, flow_handle })
    }

    pub fn evict_ack(&self, key: FlowKey) -> Result<()> {
        self.send(FlowExportReq::EvictAck { key })
    }
}

/// Queue ends held by the flow table.
pub struct FlowTableEnd {
    pub events: FlowEventSender,
    pub responses: Receiver<FlowExportResp>,
}

/// Queue ends held by the collector.
pub struct CollectorEnd {
    pub requests: Receiver<FlowExportReq>,
    pub responses: Sender<FlowExportResp>,
}

pub struct QueueStats {
    pub request: StatsHandle,
    pub response: StatsHandle,
}

/// Creates the request and response queues between flow table and collector.
pub fn flow_stats_channels(
    request_queue_size: usize,
    response_queue_size: usize,
) -> (FlowTableEnd, CollectorEnd, QueueStats) {
    let (req_sender, req_receiver, request) = bounded(request_queue_size);
    let (resp_sender, resp_receiver, response) = bounded(response_queue_size);
    (
        FlowTableEnd {
            events: FlowEventSender { sender: req_sender },
            responses: resp_receiver,
        },
        CollectorEnd {
            requests: req_receiver,
            responses: resp_sender,
        },
        QueueStats { request, response },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_request_queue_is_backpressure() {
        let (table, collector, stats) = flow_stats_channels(1, 1);
        let key = FlowKey::default();
        assert!(table
            .events
            .on_flow_add(key, Timestamp::ZERO, FlowMetadata::default())
            .is_ok());
        assert_eq!(
            table.events.on_flow_delete(key, Timestamp::ZERO),
            Err(Error::QueueFull)
        );
        assert_eq!(stats.request.pending(), 1);

        drop(collector);

        let (table, collector, _) = flow_stats_channels(4, 4);
        drop(collector);
        assert_eq!(table.events.evict_ack(key), Err(Error::QueueTerminated));
    }
}

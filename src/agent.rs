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

use std::path::Path;
use std::sync::{Arc, Weak};

use flexi_logger::LoggerHandle;
use log::info;

use public::counter::{Countable, RefCountable};

use crate::config::{Config, ConfigHandler, RuntimeConfig};
use crate::error::Result;
use crate::flow_stats::{
    flow_stats_channels, FlowRecordSink, FlowStatsCollector, FlowStatsCollectorThread,
    FlowTableEnd, KernelFlowTable,
};
use crate::utils::{
    logger::{init_logger, LogLevelCounter},
    stats::{self, StatsOption},
};

/// Wires config, logging, stats reporting and the collector thread.
pub struct FlowStatsAgent {
    config_handler: ConfigHandler,
    stats_collector: Arc<stats::Collector>,
    collector_thread: FlowStatsCollectorThread,
}

impl FlowStatsAgent {
    /// Loads the yaml config at `config_path`, starts the global logger and
    /// then the agent.
    pub fn start<P: AsRef<Path>>(
        config_path: P,
        kernel: Box<dyn KernelFlowTable>,
        sink: Box<dyn FlowRecordSink>,
    ) -> Result<(Self, FlowTableEnd)> {
        let config = Config::load_from_file(config_path)?;
        let handler = ConfigHandler::new(config)?;
        let logger = init_logger(&handler.candidate_config.log)?;
        Self::with_handler(handler, Some(logger), kernel, sink)
    }

    /// Starts the agent without touching the global logger.
    pub fn new(
        config: Config,
        kernel: Box<dyn KernelFlowTable>,
        sink: Box<dyn FlowRecordSink>,
    ) -> Result<(Self, FlowTableEnd)> {
        Self::with_handler(ConfigHandler::new(config)?, None, kernel, sink)
    }

    fn with_handler(
        mut config_handler: ConfigHandler,
        logger: Option<(LoggerHandle, LogLevelCounter)>,
        kernel: Box<dyn KernelFlowTable>,
        sink: Box<dyn FlowRecordSink>,
    ) -> Result<(Self, FlowTableEnd)> {
        let stats_collector = Arc::new(stats::Collector::new());
        if let Some((handle, log_level_counter)) = logger {
            config_handler.set_logger_handle(handle);
            stats_collector.register_countable(
                "log_counter",
                Countable::Owned(Box::new(log_level_counter)),
                Default::default(),
            );
        }

        let conf = config_handler.candidate_config.flow_stats.clone();
        let (flow_table, collector_end, queue_stats) =
            flow_stats_channels(conf.request_queue_size, conf.response_queue_size);
        for (module, handle) in [
            ("flow-table-to-flow-stats", queue_stats.request),
            ("flow-stats-to-flow-table", queue_stats.response),
        ] {
            stats_collector.register_countable(
                "queue",
                Countable::Owned(Box::new(handle)),
                vec![StatsOption::Tag("module", module.to_owned())],
            );
        }

        let collector =
            FlowStatsCollector::new(config_handler.flow_stats(), kernel, sink, collector_end);
        stats_collector.register_countable(
            "flow_stats",
            Countable::Ref(Arc::downgrade(collector.counter()) as Weak<dyn RefCountable>),
            Default::default(),
        );
        stats_collector.register_countable(
            "flow_export",
            Countable::Ref(
                Arc::downgrade(collector.export_rate_counter()) as Weak<dyn RefCountable>
            ),
            Default::default(),
        );

        let stats_config = &config_handler.candidate_config.stats;
        if let Some(client) = stats::statsd_client(stats_config)? {
            stats_collector.start(client, stats_config.interval);
        }

        let mut collector_thread = FlowStatsCollectorThread::new(collector);
        collector_thread.start()?;
        info!(
            "flow stats agent started, router id {}, {} flows per pass",
            conf.router_id, conf.flow_count_per_pass
        );

        Ok((
            Self {
                config_handler,
                stats_collector,
                collector_thread,
            },
            flow_table,
        ))
    }

    /// Applies runtime values, effective from the next collection pass.
    pub fn on_config(&mut self, runtime: RuntimeConfig) -> Result<()> {
        Ok(self.config_handler.on_config(runtime)?)
    }

    pub fn stats_collector(&self) -> &Arc<stats::Collector> {
        &self.stats_collector
    }

    pub fn collector_thread(&self) -> &FlowStatsCollectorThread {
        &self.collector_thread
    }

    pub fn stop(&mut self) {
        self.collector_thread.stop();
        self.stats_collector.stop();
        info!("flow stats agent stopped");
    }
}

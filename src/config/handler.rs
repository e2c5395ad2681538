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
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{access::Map, ArcSwap};
use flexi_logger::LoggerHandle;
use log::{info, warn, Level};

use super::config::{Config, ConfigError, RuntimeConfig};

const MAX_FLOW_COUNT_PER_PASS: u32 = 1 << 20;

type Access<C> = Map<Arc<ArcSwap<ModuleConfig>>, ModuleConfig, fn(&ModuleConfig) -> &C>;

pub type FlowStatsAccess = Access<FlowStatsConfig>;

pub type LogAccess = Access<LogConfig>;

pub type StatsAccess = Access<StatsConfig>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowStatsConfig {
    pub router_id: IpAddr,
    pub flow_age_time: Duration,
    pub flow_export_rate: u32,
    pub flow_count_per_pass: usize,
    pub delete_short_flow: bool,

    pub flow_stats_interval: Duration,
    pub flow_stats_min_interval: Duration,
    pub request_queue_size: usize,
    pub response_queue_size: usize,
    pub request_drain_per_pass: usize,
    pub flow_tcp_syn_age_time: Duration,
    pub evict_retry_interval: Duration,
    pub max_sampling_threshold: u64,
    pub link_capacity: Option<u64>,
    pub adaptive_pass: bool,
    pub flow_table_size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: Level,
    pub log_file: Option<String>,
    pub rotate_size: u64,
    pub keep_files: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsConfig {
    pub statsd_host: Option<String>,
    pub statsd_prefix: String,
    pub interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleConfig {
    pub flow_stats: FlowStatsConfig,
    pub log: LogConfig,
    pub stats: StatsConfig,
}

impl TryFrom<(Config, RuntimeConfig)> for ModuleConfig {
    type Error = ConfigError;

    fn try_from(conf: (Config, RuntimeConfig)) -> Result<Self, Self::Error> {
        let (static_config, conf) = conf;
        if conf.flow_count_per_pass == 0 || conf.flow_count_per_pass > MAX_FLOW_COUNT_PER_PASS {
            return Err(ConfigError::RuntimeConfigInvalid(format!(
                "flow-count-per-pass {} not in [1, {}]",
                conf.flow_count_per_pass, MAX_FLOW_COUNT_PER_PASS
            )));
        }
        if conf.flow_cache_timeout == 0 {
            return Err(ConfigError::RuntimeConfigInvalid(
                "flow-cache-timeout must be positive".to_owned(),
            ));
        }
        let log_level = Level::from_str(&conf.log_level).map_err(|_| {
            ConfigError::RuntimeConfigInvalid(format!("log-level {} unknown", conf.log_level))
        })?;

        let yaml = &static_config.flow_stats;
        Ok(Self {
            flow_stats: FlowStatsConfig {
                router_id: yaml.router_id,
                flow_age_time: Duration::from_secs(conf.flow_cache_timeout as u64),
                flow_export_rate: conf.flow_export_rate,
                flow_count_per_pass: conf.flow_count_per_pass as usize,
                delete_short_flow: conf.delete_short_flow,
                flow_stats_interval: yaml.flow_stats_interval,
                flow_stats_min_interval: yaml.flow_stats_min_interval,
                request_queue_size: yaml.request_queue_size,
                response_queue_size: yaml.response_queue_size,
                request_drain_per_pass: yaml.request_drain_per_pass,
                flow_tcp_syn_age_time: yaml.flow_tcp_syn_age_time,
                evict_retry_interval: yaml.evict_retry_interval,
                max_sampling_threshold: yaml.max_sampling_threshold,
                link_capacity: Some(yaml.link_capacity).filter(|c| *c > 0),
                adaptive_pass: yaml.adaptive_pass,
                flow_table_size: yaml.flow_table_size,
            },
            log: LogConfig {
                log_level,
                log_file: static_config.log.log_file.clone(),
                rotate_size: static_config.log.rotate_size_mb << 20,
                keep_files: static_config.log.keep_files,
            },
            stats: StatsConfig {
                statsd_host: static_config.stats.statsd_host.clone(),
                statsd_prefix: static_config.stats.statsd_prefix.clone(),
                interval: static_config.stats.interval,
            },
        })
    }
}

pub struct ConfigHandler {
    pub logger_handle: Option<LoggerHandle>,
    pub static_config: Config,
    pub candidate_config: ModuleConfig,
    pub current_config: Arc<ArcSwap<ModuleConfig>>,
}

impl ConfigHandler {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let candidate_config: ModuleConfig = (config.clone(), config.runtime.clone()).try_into()?;
        let current_config = Arc::new(ArcSwap::from_pointee(candidate_config.clone()));
        Ok(Self {
            logger_handle: None,
            static_config: config,
            candidate_config,
            current_config,
        })
    }

    pub fn set_logger_handle(&mut self, handle: LoggerHandle) {
        self.logger_handle = Some(handle);
    }

    pub fn flow_stats(&self) -> FlowStatsAccess {
        Map::new(self.current_config.clone(), |config| -> &FlowStatsConfig {
            &config.flow_stats
        })
    }

    pub fn log(&self) -> LogAccess {
        Map::new(self.current_config.clone(), |config| -> &LogConfig {
            &config.log
        })
    }

    pub fn stats(&self) -> StatsAccess {
        Map::new(self.current_config.clone(), |config| -> &StatsConfig {
            &config.stats
        })
    }

    /// Applies runtime values pushed by the controller.
    ///
    /// Invalid values are rejected as a whole and the running config is kept.
    /// Collector components pick up changes on their next tick.
    pub fn on_config(&mut self, runtime: RuntimeConfig) -> Result<(), ConfigError> {
        let mut new_config: ModuleConfig = match (self.static_config.clone(), runtime).try_into()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("{}, keep current config", e);
                return Err(e);
            }
        };
        let candidate_config = &mut self.candidate_config;

        if candidate_config.flow_stats != new_config.flow_stats {
            let (old, new) = (&candidate_config.flow_stats, &new_config.flow_stats);
            if old.flow_age_time != new.flow_age_time {
                info!("flow_cache_timeout set to {:?}", new.flow_age_time);
            }
            if old.flow_export_rate != new.flow_export_rate {
                info!("flow_export_rate set to {}", new.flow_export_rate);
            }
            if old.flow_count_per_pass != new.flow_count_per_pass {
                info!("flow_count_per_pass set to {}", new.flow_count_per_pass);
            }
            if old.delete_short_flow != new.delete_short_flow {
                info!("delete_short_flow set to {}", new.delete_short_flow);
            }
        }

        if candidate_config.log.log_level != new_config.log.log_level {
            match self.logger_handle.as_mut() {
                Some(handle) => match handle
                    .parse_and_push_temp_spec(new_config.log.log_level.as_str().to_lowercase())
                {
                    Ok(_) => info!("log level set to {}", new_config.log.log_level),
                    Err(e) => {
                        warn!("failed to set log_level: {}", e);
                        new_config.log.log_level = candidate_config.log.log_level;
                    }
                },
                None => info!("log level set to {}", new_config.log.log_level),
            }
        }

        *candidate_config = new_config;
        self.current_config.store(Arc::new(self.candidate_config.clone()));
        Ok(())
    }
}

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

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::flow_stats::FLOW_COUNT_PER_PASS;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("runtime config invalid: {0}")]
    RuntimeConfigInvalid(String),
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
}

/// Static configuration loaded from yaml at startup.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub flow_stats: FlowStatsYamlConfig,
    pub log: LogYamlConfig,
    pub stats: StatsYamlConfig,
    // initial values of the runtime adjustable knobs
    pub runtime: RuntimeConfig,
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        if contents.trim().is_empty() {
            // parsing empty string leads to EOF error
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        cfg.flow_stats.validate()?;
        Ok(cfg)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlowStatsYamlConfig {
    pub router_id: IpAddr,
    #[serde(with = "humantime_serde")]
    pub flow_stats_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub flow_stats_min_interval: Duration,
    pub request_queue_size: usize,
    pub response_queue_size: usize,
    pub request_drain_per_pass: usize,
    #[serde(with = "humantime_serde")]
    pub flow_tcp_syn_age_time: Duration,
    #[serde(with = "humantime_serde")]
    pub evict_retry_interval: Duration,
    pub max_sampling_threshold: u64,
    // bytes per second, 0 disables the sanity bound on counter deltas
    pub link_capacity: u64,
    // derive pass size and interval from the flow count instead of the
    // configured flow-count-per-pass
    pub adaptive_pass: bool,
    pub flow_table_size: usize,
}

impl Default for FlowStatsYamlConfig {
    fn default() -> Self {
        Self {
            router_id: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            flow_stats_interval: Duration::from_secs(1),
            flow_stats_min_interval: Duration::from_millis(100),
            request_queue_size: 16384,
            response_queue_size: 16384,
            request_drain_per_pass: 1024,
            flow_tcp_syn_age_time: Duration::from_secs(180),
            evict_retry_interval: Duration::from_secs(5),
            max_sampling_threshold: 65536,
            link_capacity: 0,
            adaptive_pass: false,
            flow_table_size: 256 * 1024,
        }
    }
}

impl FlowStatsYamlConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_stats_min_interval.is_zero()
            || self.flow_stats_min_interval > self.flow_stats_interval
        {
            return Err(ConfigError::YamlConfigInvalid(format!(
                "flow-stats-min-interval {:?} must be in (0, {:?}]",
                self.flow_stats_min_interval, self.flow_stats_interval
            )));
        }
        if self.request_queue_size == 0 || self.response_queue_size == 0 {
            return Err(ConfigError::YamlConfigInvalid(
                "queue size must be positive".to_owned(),
            ));
        }
        if self.request_drain_per_pass == 0 {
            return Err(ConfigError::YamlConfigInvalid(
                "request-drain-per-pass must be positive".to_owned(),
            ));
        }
        if self.flow_table_size == 0 {
            return Err(ConfigError::YamlConfigInvalid(
                "flow-table-size must be positive".to_owned(),
            ));
        }
        if self.max_sampling_threshold == 0 {
            return Err(ConfigError::YamlConfigInvalid(
                "max-sampling-threshold must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogYamlConfig {
    pub log_file: Option<String>,
    pub rotate_size_mb: u64,
    pub keep_files: usize,
}

impl Default for LogYamlConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            rotate_size_mb: 100,
            keep_files: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct StatsYamlConfig {
    pub statsd_host: Option<String>,
    pub statsd_prefix: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for StatsYamlConfig {
    fn default() -> Self {
        Self {
            statsd_host: None,
            statsd_prefix: "vrouter.flow_stats".to_owned(),
            interval: Duration::from_secs(10),
        }
    }
}

/// Values pushed by the controller while running.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    // seconds
    pub flow_cache_timeout: u32,
    // records per second
    pub flow_export_rate: u32,
    pub flow_count_per_pass: u32,
    pub delete_short_flow: bool,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flow_cache_timeout: 180,
            flow_export_rate: 1000,
            flow_count_per_pass: FLOW_COUNT_PER_PASS as u32,
            delete_short_flow: true,
            log_level: "info".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        assert_eq!(Config::load("").unwrap(), Config::default());
    }

    #[test]
    fn parse_yaml() {
        let yaml = r#"
flow-stats:
  router-id: 10.1.1.1
  flow-stats-interval: 2s
  flow-stats-min-interval: 200ms
  link-capacity: 1250000000
  adaptive-pass: true
log:
  log-file: /var/log/flow-stats.log
runtime:
  flow-cache-timeout: 60
  flow-export-rate: 0
"#;
        let cfg = Config::load(yaml).unwrap();
        assert_eq!(cfg.flow_stats.router_id, "10.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.flow_stats.flow_stats_interval, Duration::from_secs(2));
        assert_eq!(cfg.flow_stats.flow_stats_min_interval, Duration::from_millis(200));
        assert_eq!(cfg.flow_stats.request_queue_size, 16384);
        assert!(cfg.flow_stats.adaptive_pass);
        assert_eq!(cfg.flow_stats.flow_table_size, 256 * 1024);
        assert_eq!(cfg.log.log_file.as_deref(), Some("/var/log/flow-stats.log"));
        assert_eq!(cfg.runtime.flow_cache_timeout, 60);
        assert_eq!(cfg.runtime.flow_export_rate, 0);
        assert_eq!(cfg.runtime.flow_count_per_pass, 200);
    }

    #[test]
    fn reject_invalid_interval() {
        let yaml = r#"
flow-stats:
  flow-stats-interval: 1s
  flow-stats-min-interval: 5s
"#;
        assert!(matches!(
            Config::load(yaml),
            Err(ConfigError::YamlConfigInvalid(_))
        ));
    }

    #[test]
    fn reject_empty_flow_table() {
        assert!(Config::load("flow-stats:\n  flow-table-size: 0\n").is_err());
    }

    #[test]
    fn reject_unknown_types() {
        assert!(Config::load("flow-stats: [1, 2]").is_err());
    }
}

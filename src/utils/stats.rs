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

use std::fmt;
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence::{
    prelude::*, Counter as StatsdCounter, Gauge, Metric, MetricBuilder, StatsdClient,
    UdpMetricSink,
};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use public::counter::{Countable, Counter, CounterType};

use crate::config::StatsConfig;
use crate::error::{Error, Result};

pub enum StatsOption {
    Tag(&'static str, String),
}

struct Source {
    module: &'static str,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

#[derive(Debug)]
pub struct Batch {
    pub module: &'static str,
    pub tags: Vec<(&'static str, String)>,
    pub points: Vec<Counter>,
}

/// Periodically snapshots registered counters and ships them to statsd.
pub struct Collector {
    sources: Arc<Mutex<Vec<Source>>>,
    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self {
            sources: Arc::new(Mutex::new(vec![])),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            countable,
            tags: vec![],
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                StatsOption::Tag(k, _) => warn!("duplicate tag {} for {}", k, module),
            }
        }
        let mut sources = self.sources.lock();
        sources.retain(|s| {
            let closed = s.countable.closed();
            if !closed && s.module == source.module && s.tags == source.tags {
                warn!("found duplicated counter source {}, replacing", s);
                return false;
            }
            !closed
        });
        sources.push(source);
    }

    pub fn deregister_countable(&self, module: &'static str, tags: &[(&'static str, String)]) {
        self.sources
            .lock()
            .retain(|s| !(s.module == module && s.tags == tags));
    }

    /// Collects one batch per live source. Counted values are reset.
    pub fn snapshot(&self) -> Vec<Batch> {
        let mut sources = self.sources.lock();
        sources.retain(|s| !s.countable.closed());
        sources
            .iter()
            .map(|s| Batch {
                module: s.module,
                tags: s.tags.clone(),
                points: s.countable.get_counters(),
            })
            .filter(|b| !b.points.is_empty())
            .collect()
    }

    fn send_metrics<'a, T: Metric + From<String>>(
        mut b: MetricBuilder<'a, '_, T>,
        tags: &'a [(&'static str, String)],
    ) {
        for (k, v) in tags {
            b = b.with_tag(k, v);
        }
        b.send();
    }

    /// Returns the number of points reported.
    pub fn report(&self, client: &StatsdClient) -> usize {
        let mut sent = 0;
        for batch in self.snapshot() {
            for (name, counter_type, value) in batch.points.iter() {
                let metric = format!("{}.{}", batch.module, name);
                match counter_type {
                    CounterType::Counted => Self::send_metrics::<StatsdCounter>(
                        client.count_with_tags(&metric, *value),
                        &batch.tags,
                    ),
                    CounterType::Gauged => Self::send_metrics::<Gauge>(
                        client.gauge_with_tags(&metric, *value),
                        &batch.tags,
                    ),
                }
                sent += 1;
            }
        }
        sent
    }

    pub fn start(&self, client: StatsdClient, interval: Duration) {
        {
            let mut started = self.running.0.lock();
            if *started {
                return;
            }
            *started = true;
        }

        let running = self.running.clone();
        let sources = self.sources.clone();
        let collector = Collector {
            sources,
            running: running.clone(),
            thread: Mutex::new(None),
        };
        let spawned = thread::Builder::new()
            .name("stats-collector".to_owned())
            .spawn(move || loop {
                let n = collector.report(&client);
                debug!("reported {} stats points", n);

                let (running, timer) = &*running;
                let mut running = running.lock();
                if !*running {
                    break;
                }
                timer.wait_for(&mut running, interval);
                if !*running {
                    break;
                }
            });
        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                info!("stats collector started");
            }
            Err(e) => {
                warn!("stats collector thread spawn failed: {}", e);
                *self.running.0.lock() = false;
            }
        }
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        *self.running.0.lock() = false;
        self.running.1.notify_all();
        self.thread.lock().take()
    }

    pub fn stop(&self) {
        if let Some(handle) = self.notify_stop() {
            let _ = handle.join();
            info!("stats collector stopped");
        }
    }
}

/// Builds a statsd client from config, `None` when no host is configured.
pub fn statsd_client(config: &StatsConfig) -> Result<Option<StatsdClient>> {
    let Some(host) = config.statsd_host.as_ref() else {
        return Ok(None);
    };
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(host.as_str(), socket)
        .map_err(|e| Error::Stats(e.to_string()))?;
    Ok(Some(StatsdClient::from_sink(&config.statsd_prefix, sink)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use cadence::NopMetricSink;

    use public::counter::{CounterValue, RefCountable};

    use super::*;

    #[derive(Default)]
    struct TestCounter {
        hits: AtomicU64,
    }

    impl RefCountable for TestCounter {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "hits",
                CounterType::Counted,
                CounterValue::Unsigned(self.hits.swap(0, Ordering::Relaxed)),
            )]
        }
    }

    #[test]
    fn snapshot_drops_closed_sources() {
        let collector = Collector::new();
        let counter = Arc::new(TestCounter::default());
        counter.hits.fetch_add(3, Ordering::Relaxed);
        collector.register_countable(
            "test",
            Countable::Ref(Arc::downgrade(&counter) as std::sync::Weak<dyn RefCountable>),
            vec![StatsOption::Tag("id", "1".to_owned())],
        );

        let batches = collector.snapshot();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].points[0].2, CounterValue::Unsigned(3));
        assert_eq!(collector.snapshot()[0].points[0].2, CounterValue::Unsigned(0));

        drop(counter);
        assert!(collector.snapshot().is_empty());
    }

    #[test]
    fn report_through_statsd() {
        let collector = Collector::new();
        let counter = Arc::new(TestCounter::default());
        collector.register_countable(
            "test",
            Countable::Ref(Arc::downgrade(&counter) as std::sync::Weak<dyn RefCountable>),
            vec![],
        );
        let client = StatsdClient::from_sink("flow", NopMetricSink);
        assert_eq!(collector.report(&client), 1);
    }

    #[test]
    fn no_client_without_host() {
        let config = StatsConfig {
            statsd_host: None,
            statsd_prefix: "p".to_owned(),
            interval: Duration::from_secs(1),
        };
        assert!(statsd_client(&config).unwrap().is_none());
    }
}

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

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{info, warn};
use parking_lot::{Condvar, Mutex};

use super::collector::{FlowStatsCollector, FlowStatsCounter};
use crate::common::Timestamp;
use crate::error::{Error, Result};

const THREAD_NAME: &str = "flow-stats";

/// Runs a [`FlowStatsCollector`] on its own thread.
///
/// Between passes the thread sleeps for the interval returned by the last
/// pass, or until stopped.
pub struct FlowStatsCollectorThread {
    collector: Option<FlowStatsCollector>,
    counter: Arc<FlowStatsCounter>,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread_handle: Option<JoinHandle<FlowStatsCollector>>,
}

impl FlowStatsCollectorThread {
    pub fn new(collector: FlowStatsCollector) -> Self {
        Self {
            counter: collector.counter().clone(),
            collector: Some(collector),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread_handle: None,
        }
    }

    pub fn counter(&self) -> &Arc<FlowStatsCounter> {
        &self.counter
    }

    pub fn is_running(&self) -> bool {
        *self.running.0.lock()
    }

    pub fn start(&mut self) -> Result<()> {
        {
            let mut running = self.running.0.lock();
            if *running {
                warn!("flow stats collector already started, do nothing.");
                return Ok(());
            }
            *running = true;
        }
        let Some(mut collector) = self.collector.take() else {
            warn!("flow stats collector still owned by a stopping thread");
            *self.running.0.lock() = false;
            return Ok(());
        };

        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || {
                let (lock, cvar) = &*running;
                loop {
                    let result = collector.run(Timestamp::now());
                    let mut running = lock.lock();
                    if !*running {
                        break;
                    }
                    cvar.wait_for(&mut running, result.next_interval);
                    if !*running {
                        break;
                    }
                }
                collector
            });
        match handle {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                info!("flow stats collector started");
                Ok(())
            }
            Err(e) => {
                *self.running.0.lock() = false;
                Err(Error::ThreadSpawn(THREAD_NAME, e))
            }
        }
    }

    pub fn notify_stop(&mut self) -> Option<JoinHandle<FlowStatsCollector>> {
        let (lock, cvar) = &*self.running;
        {
            let mut running = lock.lock();
            if !*running {
                warn!("flow stats collector already stopped, do nothing.");
                return None;
            }
            *running = false;
        }
        cvar.notify_one();
        info!("notified flow stats collector to stop");
        self.thread_handle.take()
    }

    /// Stops the thread and takes the collector back, so it can be
    /// started again.
    pub fn stop(&mut self) {
        let Some(handle) = self.notify_stop() else {
            return;
        };
        match handle.join() {
            Ok(collector) => self.collector = Some(collector),
            Err(_) => warn!("flow stats collector thread panicked"),
        }
        info!("flow stats collector stopped");
    }
}

impl Drop for FlowStatsCollectorThread {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::config::{Config, ConfigHandler};
    use crate::flow_stats::{flow_stats_channels, LogSink, MemoryKernelTable};

    #[test]
    fn start_stop_restart() {
        let handler = ConfigHandler::new(Config::default()).unwrap();
        let (_flow_table, collector_end, _) = flow_stats_channels(16, 16);
        let collector = FlowStatsCollector::new(
            handler.flow_stats(),
            Box::new(MemoryKernelTable::new()),
            Box::new(LogSink),
            collector_end,
        );
        let mut thread = FlowStatsCollectorThread::new(collector);

        thread.start().unwrap();
        assert!(thread.is_running());
        thread.stop();
        assert!(!thread.is_running());
        assert!(thread.counter().ticks.load(Ordering::Relaxed) >= 1);

        thread.start().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        thread.stop();
        assert!(thread.counter().ticks.load(Ordering::Relaxed) >= 2);
    }
}

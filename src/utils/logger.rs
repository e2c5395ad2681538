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

use std::io;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use flexi_logger::{
    writers::LogWriter, Cleanup, Criterion, DeferredNow, FileSpec, Logger, LoggerHandle, Naming,
    Record,
};
use log::Level;

use public::counter::{self, CounterType, CounterValue, OwnedCountable};

use crate::config::LogConfig;
use crate::error::Result;

#[derive(Default)]
struct Counter {
    warning: AtomicU64,
    error: AtomicU64,
}

/// Counts warnings and errors, optionally echoing every record to stderr.
pub struct LogLevelWriter {
    counter: Arc<Counter>,
    echo_to_stderr: bool,
}

impl LogLevelWriter {
    pub fn new(echo_to_stderr: bool) -> (Self, LogLevelCounter) {
        let c = Arc::new(Counter::default());
        (
            Self {
                counter: c.clone(),
                echo_to_stderr,
            },
            LogLevelCounter(Arc::downgrade(&c)),
        )
    }
}

impl LogWriter for LogLevelWriter {
    fn write(&self, now: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        match record.level() {
            Level::Error => self.counter.error.fetch_add(1, Ordering::Relaxed),
            Level::Warn => self.counter.warning.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        if self.echo_to_stderr {
            let mut stderr = io::stderr().lock();
            flexi_logger::detailed_format(&mut stderr, now, record)?;
            io::Write::write_all(&mut stderr, b"\n")?;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        if self.echo_to_stderr {
            io::Write::flush(&mut io::stderr())?;
        }
        Ok(())
    }
}

pub struct LogLevelCounter(Weak<Counter>);

impl OwnedCountable for LogLevelCounter {
    fn get_counters(&self) -> Vec<counter::Counter> {
        match self.0.upgrade() {
            Some(counters) => vec![
                (
                    "error",
                    CounterType::Counted,
                    CounterValue::Unsigned(counters.error.swap(0, Ordering::Relaxed)),
                ),
                (
                    "warning",
                    CounterType::Counted,
                    CounterValue::Unsigned(counters.warning.swap(0, Ordering::Relaxed)),
                ),
            ],
            None => vec![],
        }
    }

    fn closed(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// Starts the global logger.
///
/// Records go to the rotated log file when one is configured, to stderr
/// otherwise. Keep the returned handle alive for runtime level changes.
pub fn init_logger(config: &LogConfig) -> Result<(LoggerHandle, LogLevelCounter)> {
    let logger = Logger::try_with_str(config.log_level.as_str().to_lowercase())?
        .format(flexi_logger::detailed_format);
    let handle = match config.log_file.as_ref() {
        Some(path) => {
            let (writer, counter) = LogLevelWriter::new(false);
            let handle = logger
                .log_to_file_and_writer(FileSpec::try_from(path)?, Box::new(writer))
                .rotate(
                    Criterion::Size(config.rotate_size),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(config.keep_files),
                )
                .start()?;
            (handle, counter)
        }
        None => {
            let (writer, counter) = LogLevelWriter::new(true);
            (logger.log_to_writer(Box::new(writer)).start()?, counter)
        }
    };
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_closes_with_writer() {
        let (writer, counter) = LogLevelWriter::new(false);
        writer.counter.warning.fetch_add(2, Ordering::Relaxed);
        let points = counter.get_counters();
        assert_eq!(points[1].2, CounterValue::Unsigned(2));
        assert!(!counter.closed());
        drop(writer);
        assert!(counter.closed());
        assert!(counter.get_counters().is_empty());
    }
}

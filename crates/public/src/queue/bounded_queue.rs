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

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{
    Receiver as CReceiver, RecvTimeoutError, Sender as CSender, TryRecvError, TrySendError,
};

use super::Error;
use crate::counter::{self, CounterType, CounterValue, OwnedCountable};

/// Creates a fixed capacity multi-producer queue.
///
/// Producers never block: a full queue hands the message back in
/// `Error::Full` and bumps the `full` counter.
pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle) {
    let (sender, receiver) = crossbeam_channel::bounded(size);
    let shared = Arc::new(Shared {
        counter: Counter::default(),
        pending: AtomicU64::new(0),
        terminated: AtomicBool::new(false),
    });
    (
        Sender {
            inner: sender,
            shared: shared.clone(),
        },
        Receiver {
            inner: receiver,
            shared: shared.clone(),
        },
        StatsHandle { shared },
    )
}

#[derive(Debug, Default)]
pub struct Counter {
    pub input: AtomicU64,
    pub output: AtomicU64,
    pub full: AtomicU64,
}

struct Shared {
    counter: Counter,
    pending: AtomicU64,
    terminated: AtomicBool,
}

pub struct Sender<T> {
    inner: CSender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> Sender<T> {
    pub fn terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Relaxed)
    }

    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        // counted before the message becomes visible to receivers
        self.shared.pending.fetch_add(1, Ordering::Relaxed);
        match self.inner.try_send(msg) {
            Ok(_) => {
                self.shared.counter.input.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(msg)) => {
                self.shared.pending.fetch_sub(1, Ordering::Relaxed);
                self.shared.counter.full.fetch_add(1, Ordering::Relaxed);
                Err(Error::Full(msg))
            }
            Err(TrySendError::Disconnected(msg)) => {
                self.shared.pending.fetch_sub(1, Ordering::Relaxed);
                self.shared.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(Some(msg), None))
            }
        }
    }

    /// Sends messages in order, stopping at the first failure.
    /// Messages after the failing one remain in `msgs`.
    pub fn send_all(&self, msgs: &mut Vec<T>) -> Result<(), Error<T>> {
        let mut iter = std::mem::take(msgs).into_iter();
        while let Some(msg) = iter.next() {
            if let Err(e) = self.send(msg) {
                msgs.extend(iter);
                return Err(e);
            }
        }
        Ok(())
    }
}

pub struct Receiver<T> {
    inner: CReceiver<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> Receiver<T> {
    pub fn terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn received(&self) {
        self.shared.counter.output.fetch_add(1, Ordering::Relaxed);
        self.shared.pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let res = match timeout {
            Some(t) => self.inner.recv_timeout(t),
            None => self
                .inner
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match res {
            Ok(v) => {
                self.received();
                Ok(v)
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                self.shared.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(None, None))
            }
        }
    }

    pub fn try_recv(&self) -> Result<Option<T>, Error<T>> {
        match self.inner.try_recv() {
            Ok(v) => {
                self.received();
                Ok(Some(v))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.shared.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(None, None))
            }
        }
    }

    /// Drains at most `max` queued messages without blocking.
    ///
    /// Returns `Error::Terminated` only when nothing could be drained and
    /// every sender is gone.
    pub fn try_recv_n(&self, max: usize, msgs: &mut Vec<T>) -> Result<usize, Error<T>> {
        let mut n = 0;
        while n < max {
            match self.try_recv() {
                Ok(Some(v)) => {
                    msgs.push(v);
                    n += 1;
                }
                Ok(None) => break,
                Err(e) if n == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(n)
    }
}

pub struct StatsHandle {
    shared: Arc<Shared>,
}

impl StatsHandle {
    pub fn pending(&self) -> u64 {
        self.shared.pending.load(Ordering::Relaxed)
    }
}

impl OwnedCountable for StatsHandle {
    fn get_counters(&self) -> Vec<counter::Counter> {
        vec![
            (
                "in",
                CounterType::Counted,
                CounterValue::Unsigned(self.shared.counter.input.swap(0, Ordering::Relaxed)),
            ),
            (
                "out",
                CounterType::Counted,
                CounterValue::Unsigned(self.shared.counter.output.swap(0, Ordering::Relaxed)),
            ),
            (
                "full",
                CounterType::Counted,
                CounterValue::Unsigned(self.shared.counter.full.swap(0, Ordering::Relaxed)),
            ),
            (
                "pending",
                CounterType::Gauged,
                CounterValue::Unsigned(self.pending()),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.shared.terminated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn full_queue_returns_message() {
        let (s, r, stats) = bounded::<u32>(2);
        assert!(s.send(1).is_ok());
        assert!(s.send(2).is_ok());
        assert_eq!(s.send(3), Err(Error::Full(3)));
        assert_eq!(stats.pending(), 2);

        let mut batch = vec![];
        assert_eq!(r.try_recv_n(10, &mut batch), Ok(2));
        assert_eq!(batch, vec![1, 2]);
        assert_eq!(stats.pending(), 0);

        let counters = stats.get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(2));
        assert_eq!(counters[2].2, CounterValue::Unsigned(1));
    }

    #[test]
    fn drain_is_bounded() {
        let (s, r, _) = bounded::<u32>(16);
        for i in 0..10 {
            s.send(i).unwrap();
        }
        let mut batch = vec![];
        assert_eq!(r.try_recv_n(4, &mut batch), Ok(4));
        assert_eq!(r.len(), 6);
    }

    #[test]
    fn send_all_keeps_unsent() {
        let (s, _r, _) = bounded::<u32>(2);
        let mut msgs = vec![1, 2, 3, 4];
        assert_eq!(s.send_all(&mut msgs), Err(Error::Full(3)));
        assert_eq!(msgs, vec![4]);
    }

    #[test]
    fn terminated_after_senders_dropped() {
        let (s, r, stats) = bounded::<u64>(1024);
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let sender = s.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        sender.send(i).unwrap();
                    }
                })
            })
            .collect();
        drop(s);
        for p in producers {
            p.join().unwrap();
        }

        let mut sum = 0;
        while let Ok(v) = r.recv(Some(Duration::from_millis(100))) {
            sum += v;
        }
        assert_eq!(sum, (0..100).sum::<u64>() * 4);
        assert!(r.terminated());
        assert!(stats.closed());
    }

    #[test]
    fn pending_stays_bounded_under_contention() {
        let (s, r, stats) = bounded::<u32>(4);
        let stats = Arc::new(stats);
        let done = Arc::new(AtomicBool::new(false));

        let sampler = {
            let (stats, done) = (stats.clone(), done.clone());
            thread::spawn(move || {
                let mut max = 0;
                while !done.load(Ordering::Relaxed) {
                    max = max.max(stats.pending());
                }
                max
            })
        };
        let consumer = thread::spawn(move || {
            let mut n = 0;
            while r.recv(None).is_ok() {
                n += 1;
            }
            n
        });
        for i in 0..10000 {
            while s.send(i).is_err() {
                thread::yield_now();
            }
        }
        drop(s);
        assert_eq!(consumer.join().unwrap(), 10000);
        done.store(true, Ordering::Relaxed);

        // queue capacity plus the one in-flight send
        assert!(sampler.join().unwrap() <= 5);
        assert_eq!(stats.pending(), 0);
    }

    #[test]
    fn send_to_dropped_receiver() {
        let (s, r, _) = bounded::<u8>(1);
        drop(r);
        assert_eq!(s.send(7), Err(Error::Terminated(Some(7), None)));
        assert!(s.terminated());
    }
}

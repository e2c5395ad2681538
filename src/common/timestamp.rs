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

// Nanoseconds since the unix epoch, 8B instead of the 16B of Duration

use std::fmt;
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};

#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl From<Duration> for Timestamp {
    fn from(d: Duration) -> Self {
        Self(d.as_nanos() as u64)
    }
}

impl From<Timestamp> for Duration {
    fn from(t: Timestamp) -> Self {
        Self::from_nanos(t.as_nanos())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Duration::from(*self).fmt(f)
    }
}

impl Timestamp {
    const NANOS_IN_SECOND: u64 = Duration::from_secs(1).as_nanos() as u64;
    const NANOS_IN_MILLIS: u64 = Duration::from_millis(1).as_nanos() as u64;
    const NANOS_IN_MICROS: u64 = Duration::from_micros(1).as_nanos() as u64;

    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Self::from)
            .unwrap_or_default()
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * Self::NANOS_IN_MICROS)
    }

    pub const fn as_micros(&self) -> u64 {
        self.0 / Self::NANOS_IN_MICROS
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * Self::NANOS_IN_MILLIS)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0 / Self::NANOS_IN_MILLIS
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * Self::NANOS_IN_SECOND)
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / Self::NANOS_IN_SECOND
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Time elapsed since `earlier`, zero if the clock went backwards.
    pub fn saturating_elapsed(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        timestamp_to_micros(self, serializer)
    }
}

pub fn timestamp_to_micros<S>(d: &Timestamp, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(d.as_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion() {
        let d = Duration::from_secs(123);
        assert_eq!(d, Duration::from(Timestamp::from(d)));
        assert_eq!(Timestamp::from_millis(1500).as_secs(), 1);
        assert_eq!(Timestamp::from_secs(2).as_micros(), 2_000_000);
    }

    #[test]
    fn elapsed_never_underflows() {
        let t1 = Timestamp::from_secs(10);
        let t2 = t1 + Duration::from_secs(5);
        assert_eq!(t2.saturating_elapsed(t1), Duration::from_secs(5));
        assert_eq!(t1.saturating_elapsed(t2), Duration::ZERO);
    }
}

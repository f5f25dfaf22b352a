// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Now utilities.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// A type representing the number of milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// Returns the current system time as milliseconds since the Unix epoch.
///
/// # Panics
///
/// Panics if the system clock is set before the Unix epoch.
pub fn system_time() -> EpochMillis {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("failed to get millis since epoch")
        .as_millis();
    u64::try_from(millis).expect("current time does not fit in a u64")
}

/// A function that returns system or mocked time.
///
/// Cloning is cheap; every clone observes the same underlying clock.
pub struct NowFn<T = EpochMillis>(Arc<dyn Fn() -> T + Send + Sync>);

impl<T> NowFn<T> {
    /// Returns the current time.
    pub fn now(&self) -> T {
        (self.0)()
    }
}

impl<T> Clone for NowFn<T> {
    fn clone(&self) -> Self {
        NowFn(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for NowFn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<now_fn>")
    }
}

impl<T> Deref for NowFn<T> {
    type Target = dyn Fn() -> T + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &(*self.0)
    }
}

impl<F, T> From<F> for NowFn<T>
where
    F: Fn() -> T + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn<T> {
        NowFn(Arc::new(f))
    }
}

/// A [`NowFn`] that returns the actual system time.
pub static SYSTEM_TIME: LazyLock<NowFn> = LazyLock::new(|| NowFn::from(system_time));

/// A [`NowFn`] that always returns zero.
pub static NOW_ZERO: LazyLock<NowFn> = LazyLock::new(|| NowFn::from(|| 0));

/// A manually advanced clock, for tests that need control over time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: EpochMillis) -> Self {
        ManualClock(Arc::new(AtomicU64::new(start)))
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to `millis`, which may move it backwards.
    pub fn set(&self, millis: EpochMillis) {
        self.0.store(millis, Ordering::SeqCst);
    }

    /// Returns a [`NowFn`] reading this clock.
    pub fn now_fn(&self) -> NowFn {
        let inner = Arc::clone(&self.0);
        NowFn::from(move || inner.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock() {
        let clock = ManualClock::new(10);
        let now = clock.now_fn();
        assert_eq!(now(), 10);
        clock.advance(5);
        assert_eq!(now.now(), 15);
        clock.set(3);
        assert_eq!((now)(), 3);
        assert_eq!((NOW_ZERO)(), 0);
        assert!((SYSTEM_TIME)() > 0);
    }
}

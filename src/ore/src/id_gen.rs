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

//! ID generation utilities.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Manages the allocation of unique, monotonically increasing IDs that can be
/// shared between threads.
///
/// IDs handed out by one generator are strictly increasing in allocation
/// order: if `a` was allocated before `b` (in the happens-before sense), then
/// `a < b`.
#[derive(Debug)]
pub struct AtomicGen<Id: From<u64>> {
    next: AtomicU64,
    phantom: PhantomData<fn() -> Id>,
}

impl<Id: From<u64>> AtomicGen<Id> {
    /// Creates a generator whose first allocated ID is `first`.
    pub const fn starting_at(first: u64) -> Self {
        AtomicGen {
            next: AtomicU64::new(first),
            phantom: PhantomData,
        }
    }

    /// Allocates a new identifier of type `Id` and advances the generator.
    ///
    /// # Panics
    ///
    /// Panics if the generator has handed out `u64::MAX` IDs.
    pub fn allocate_id(&self) -> Id {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        assert_ne!(id, u64::MAX, "id generator exhausted");
        id.into()
    }
}

impl<Id: From<u64>> Default for AtomicGen<Id> {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn gen_starts_where_asked() {
        let gen = AtomicGen::<u64>::starting_at(7);
        assert_eq!(gen.allocate_id(), 7);
        assert_eq!(gen.allocate_id(), 8);
    }

    #[test]
    fn atomic_gen_is_unique_across_threads() {
        let gen = Arc::new(AtomicGen::<u64>::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || (0..1000).map(|_| gen.allocate_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(gen.allocate_id(), 4001);
    }
}

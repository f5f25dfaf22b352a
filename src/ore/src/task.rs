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

//! Tokio task utilities.
//!
//! Every background task in the front-end is spawned through [`spawn`] so that
//! it carries a human-readable name into its tracing span.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a new asynchronous task with a name.
///
/// The name is computed lazily so that callers can build it with `format!`
/// without paying for it when tracing is disabled at the call site.
#[track_caller]
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = nc();
    let span = tracing::debug_span!("task", name = name.as_ref());
    tokio::spawn(future.instrument(span))
}

// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The request front-end of a distributed vector database.
//!
//! Every client request becomes a typed task: DDL, DML or DQL. Tasks pass
//! admission control, are stamped with a begin and end timestamp from the
//! logical clock, and execute from one of three queues. Mutations are
//! hashed onto the collection's write-ahead channels, which a time-tick
//! loop keeps advancing. Reads fan out to one replica of every shard and
//! the partial results are merged deterministically.
//!
//! [`Proxy`] is the entry point; [`backend`] has the contracts of the
//! services it drives and [`testing`] in-memory implementations of them.

pub mod backend;
pub mod channels;
pub mod config;
pub mod error;
pub mod merge;
pub mod meta_cache;
pub mod metrics;
mod proxy;
pub mod rate;
pub mod scheduler;
pub mod shard;
pub mod task;
pub mod testing;
pub mod types;

pub use crate::proxy::{CollectionInvalidation, Proxy};

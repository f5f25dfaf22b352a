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

//! Metrics for front-end subsystems.
//!
//! Each subsystem keeps its metrics in a scoped-to-it struct, which gets
//! registered (once) to the process's (or a test's) prometheus registry.
//!
//! Instead of using prometheus's (very verbose) metrics definitions, we rely on type inference to
//! reduce the verbosity a little bit. A typical subsystem will look like the following:
//!
//! ```rust
//! # use vdb_ore::metrics::{MetricsRegistry, IntCounter};
//! # use vdb_ore::metric;
//! #[derive(Debug, Clone)] // Note that prometheus metrics can safely be cloned
//! struct Metrics {
//!     pub bytes_received: IntCounter,
//! }
//!
//! impl Metrics {
//!     pub fn register_into(registry: &MetricsRegistry) -> Metrics {
//!         Metrics {
//!             bytes_received: registry.register(metric!(
//!                 name: "vdb_proxy_received_bytes",
//!                 help: "total number of bytes received",
//!             )),
//!         }
//!     }
//! }
//! ```

use prometheus::core::{
    Atomic, Collector, GenericCounter, GenericCounterVec, GenericGauge, GenericGaugeVec, Opts,
};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, Registry, DEFAULT_BUCKETS};

pub use prometheus::Opts as PrometheusOpts;
pub use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};

/// Define a metric for use in the front-end.
///
/// Histograms may pass `buckets:`; every other metric type ignores them.
#[macro_export]
macro_rules! metric {
    (
        name: $name:expr,
        help: $help:expr
        $(, const_labels: { $($cl_key:expr => $cl_value:expr ),* })?
        $(, var_labels: [ $($vl_name:expr),* ])?
        $(, buckets: $buckets:expr)?
        $(,)?
    ) => {{
        let const_labels: ::std::collections::HashMap<String, String> = (&[
            $($(
                ($cl_key.to_string(), $cl_value.to_string()),
            )*)?
        ]).into_iter().cloned().collect();
        let var_labels: ::std::vec::Vec<String> = vec![
            $(
                $($vl_name.into(),)*
            )?];
        #[allow(unused_mut)]
        let mut opts = $crate::metrics::MetricOpts::new(
            $crate::metrics::PrometheusOpts::new($name, $help)
                .const_labels(const_labels)
                .variable_labels(var_labels),
        );
        $(opts = opts.with_buckets($buckets);)?
        opts
    }}
}

/// The options a metric is registered with.
///
/// Produced by the [`metric`] macro.
#[derive(Debug, Clone)]
pub struct MetricOpts {
    /// The common prometheus options.
    pub opts: Opts,
    /// Histogram buckets. Ignored by every collector but histograms.
    pub buckets: Vec<f64>,
}

impl MetricOpts {
    /// Wraps prometheus options, using prometheus's default histogram
    /// buckets.
    pub fn new(opts: Opts) -> Self {
        MetricOpts {
            opts,
            buckets: DEFAULT_BUCKETS.to_vec(),
        }
    }

    /// Overrides the histogram buckets.
    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    fn label_names(&self) -> Vec<String> {
        self.opts.variable_labels.clone()
    }
}

/// The front-end metrics registry.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Registry,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        MetricsRegistry {
            inner: Registry::new(),
        }
    }

    /// Register a metric defined with the [`metric`] macro.
    ///
    /// # Panics
    ///
    /// Panics if a metric with the same name was registered before. Metric
    /// names are static, so this is a programming error.
    pub fn register<M>(&self, opts: MetricOpts) -> M
    where
        M: MakeCollector,
    {
        let collector = M::make_collector(opts);
        self.inner
            .register(Box::new(collector.clone()))
            .expect("registering metric");
        collector
    }

    /// Gather all the metrics from the metrics registry for reporting.
    ///
    /// See also [`prometheus::Registry::gather`].
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.gather()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A wrapper for creating prometheus metrics more conveniently.
///
/// Together with the [`metric`] macro, this trait is mainly used by [`MetricsRegistry`] and should
/// not normally be used outside the metric registration flow.
pub trait MakeCollector: Collector + Clone + 'static {
    /// Creates a new collector.
    fn make_collector(opts: MetricOpts) -> Self;
}

impl<T> MakeCollector for GenericCounter<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: MetricOpts) -> Self {
        Self::with_opts(opts.opts).expect("defining a counter")
    }
}

impl<T> MakeCollector for GenericCounterVec<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: MetricOpts) -> Self {
        let labels = opts.label_names();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        Self::new(opts.opts, &labels).expect("defining a counter vec")
    }
}

impl<T> MakeCollector for GenericGauge<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: MetricOpts) -> Self {
        Self::with_opts(opts.opts).expect("defining a gauge")
    }
}

impl<T> MakeCollector for GenericGaugeVec<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: MetricOpts) -> Self {
        let labels = opts.label_names();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        Self::new(opts.opts, &labels).expect("defining a gauge vec")
    }
}

impl MakeCollector for Histogram {
    fn make_collector(opts: MetricOpts) -> Self {
        Histogram::with_opts(HistogramOpts {
            common_opts: opts.opts,
            buckets: opts.buckets,
        })
        .expect("defining a histogram")
    }
}

impl MakeCollector for HistogramVec {
    fn make_collector(opts: MetricOpts) -> Self {
        let labels = opts.label_names();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        Self::new(
            HistogramOpts {
                common_opts: opts.opts,
                buckets: opts.buckets,
            },
            &labels,
        )
        .expect("defining a histogram vec")
    }
}

#[cfg(test)]
mod tests {
    use crate::metric;

    use super::*;

    #[test]
    fn register_and_gather() {
        let registry = MetricsRegistry::new();
        let calls: IntCounterVec = registry.register(metric!(
            name: "test_calls",
            help: "calls",
            var_labels: ["method"],
        ));
        let latency: HistogramVec = registry.register(metric!(
            name: "test_latency_seconds",
            help: "latency",
            var_labels: ["method"],
            buckets: vec![0.1, 1.0],
        ));
        let depth: IntGauge = registry.register(metric!(name: "test_depth", help: "depth"));

        calls.with_label_values(&["insert"]).inc();
        latency.with_label_values(&["insert"]).observe(0.5);
        depth.set(3);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"test_calls".to_string()));
        assert!(names.contains(&"test_latency_seconds".to_string()));
        assert!(names.contains(&"test_depth".to_string()));
    }
}

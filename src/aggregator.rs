//! The per-cycle metric aggregation engine.
//!
//! Every submission is routed to a context -- the unique identity of a time
//! series within a cycle -- and folded into kind-specific reducer state. A
//! flush drains the cycle-scoped state into normalized points and purges
//! contexts that have gone quiet. One engine, one kind tag per metric name,
//! one reducer dispatch; the legacy two-layer arrangement this replaces
//! lives on only as the thin facade in `store`.

use metric::{Attributes, Error, MetricKind, Point, TagSet};
use quantiles::ckms::CKMS;
use seahash::SeaHasher;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;
use time;

/// Hash map keyed with seahash, the house hasher for hot maps.
pub type HashMapSea<K, V> = HashMap<K, V, BuildHasherDefault<SeaHasher>>;

/// Error bound for the percentile summaries kept per histogram context.
const CKMS_ERROR: f64 = 0.001;

/// Contexts untouched for this many seconds past the configured minimum
/// collection interval are purged at flush.
pub const DEFAULT_EXPIRY_SECONDS: f64 = 300.0;

/// The identity of a single time series: metric name, sorted tags and the
/// optional hostname / device. Two submissions with the same tag set in any
/// order resolve to the same context.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey {
    /// The metric name.
    pub name: String,
    /// Sorted, deduplicated tags.
    pub tags: TagSet,
    /// Hostname the series is reported for.
    pub hostname: Option<String>,
    /// Device the series is reported for.
    pub device_name: Option<String>,
}

/// A histogram statistic that may be enabled for flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistAggregate {
    /// Smallest sample of the cycle.
    Min,
    /// Largest sample of the cycle.
    Max,
    /// 50th percentile.
    Median,
    /// Arithmetic mean.
    Avg,
    /// Sum of all samples.
    Sum,
    /// Number of samples.
    Count,
}

impl HistAggregate {
    /// The statistic's point-name suffix.
    pub fn suffix(self) -> &'static str {
        match self {
            HistAggregate::Min => "min",
            HistAggregate::Max => "max",
            HistAggregate::Median => "median",
            HistAggregate::Avg => "avg",
            HistAggregate::Sum => "sum",
            HistAggregate::Count => "count",
        }
    }

    /// Parse a configured aggregate name.
    pub fn from_name(name: &str) -> Option<HistAggregate> {
        match name {
            "min" => Some(HistAggregate::Min),
            "max" => Some(HistAggregate::Max),
            "median" => Some(HistAggregate::Median),
            "avg" => Some(HistAggregate::Avg),
            "sum" => Some(HistAggregate::Sum),
            "count" => Some(HistAggregate::Count),
            _ => None,
        }
    }

    /// The statistics enabled when none are configured.
    pub fn defaults() -> Vec<HistAggregate> {
        vec![
            HistAggregate::Max,
            HistAggregate::Median,
            HistAggregate::Avg,
            HistAggregate::Count,
        ]
    }
}

/// Cycle-scoped histogram state: exact extrema and sum next to a CKMS
/// summary for the percentile queries.
#[derive(Clone, Debug)]
struct Histo {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
    ckms: CKMS<f64>,
}

impl Histo {
    fn new() -> Histo {
        Histo {
            min: ::std::f64::INFINITY,
            max: ::std::f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
            ckms: CKMS::new(CKMS_ERROR),
        }
    }

    fn insert(&mut self, value: f64) {
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.count += 1;
        self.ckms.insert(value);
    }
}

/// Reducer state, one variant per metric kind.
#[derive(Clone, Debug)]
enum Value {
    /// Latest value and its timestamp. Survives flushes until expiry.
    Gauge { value: f64, timestamp: f64 },
    /// Running sum for the open cycle, `None` when nothing arrived.
    Count { value: Option<f64> },
    /// Cycle delta over an ever-increasing raw counter. `last_raw` survives
    /// flushes so resets can be detected across cycles.
    MonotonicCount { delta: Option<f64>, last_raw: Option<f64> },
    /// Up to two `(timestamp, value)` observations; the derivative is taken
    /// at flush and the newest observation is carried forward.
    Rate { samples: Vec<(f64, f64)> },
    /// All raw values of the open cycle.
    Histogram(Histo),
    /// Unique values of the open cycle, deduplicated on bit pattern.
    Set { values: HashSet<u64> },
}

impl Value {
    fn new(kind: MetricKind) -> Value {
        match kind {
            MetricKind::Gauge => Value::Gauge {
                value: 0.0,
                timestamp: 0.0,
            },
            MetricKind::Count => Value::Count { value: None },
            MetricKind::MonotonicCount => Value::MonotonicCount {
                delta: None,
                last_raw: None,
            },
            MetricKind::Rate => Value::Rate {
                samples: Vec::with_capacity(2),
            },
            MetricKind::Histogram => Value::Histogram(Histo::new()),
            MetricKind::Set => Value::Set {
                values: HashSet::new(),
            },
            // Raw two-sample counters belong to the legacy store; the
            // aggregator's closest kind is Rate.
            MetricKind::Counter => Value::Rate {
                samples: Vec::with_capacity(2),
            },
        }
    }
}

#[derive(Clone, Debug)]
struct Context {
    value: Value,
    last_seen: f64,
}

/// The per-check aggregation engine.
///
/// Contexts are created on first submission and owned exclusively by this
/// struct; checks reach it only through the submission verbs. `flush`
/// produces the cycle's normalized points in deterministic order and resets
/// all cycle-scoped accumulators.
pub struct MetricsAggregator {
    hostname: String,
    expiry_seconds: f64,
    aggregates: Vec<HistAggregate>,
    percentiles: Vec<f64>,
    contexts: HashMapSea<ContextKey, Context>,
    kinds: HashMap<String, MetricKind>,
    last_flush_count: usize,
}

impl MetricsAggregator {
    /// Create an aggregator with default expiry, aggregates and
    /// percentiles.
    pub fn new(hostname: &str) -> MetricsAggregator {
        MetricsAggregator::with_options(
            hostname,
            DEFAULT_EXPIRY_SECONDS,
            HistAggregate::defaults(),
            &[0.95],
        )
    }

    /// Create an aggregator with explicit expiry and histogram
    /// configuration. Percentiles are rounded to two decimal digits and
    /// must land in the open interval (0, 1); anything else is dropped with
    /// a warning.
    pub fn with_options(
        hostname: &str,
        expiry_seconds: f64,
        aggregates: Vec<HistAggregate>,
        percentiles: &[f64],
    ) -> MetricsAggregator {
        MetricsAggregator {
            hostname: hostname.to_string(),
            expiry_seconds: expiry_seconds,
            aggregates: aggregates,
            percentiles: sanitize_percentiles(percentiles),
            contexts: HashMapSea::default(),
            kinds: HashMap::new(),
            last_flush_count: 0,
        }
    }

    /// Record the value of a gauge. Latest submission wins.
    pub fn gauge(
        &mut self,
        name: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
        timestamp: Option<f64>,
    ) -> Result<(), Error> {
        self.submit(
            name,
            MetricKind::Gauge,
            value,
            tags,
            hostname,
            device_name,
            timestamp,
        )
    }

    /// Add `value` to the cycle's running sum for this context.
    pub fn count(
        &mut self,
        name: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.submit(
            name,
            MetricKind::Count,
            value,
            tags,
            hostname,
            device_name,
            None,
        )
    }

    /// Add one to the cycle's running sum for this context.
    pub fn increment(
        &mut self,
        name: &str,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.count(name, 1.0, tags, hostname, device_name)
    }

    /// Subtract one from the cycle's running sum for this context.
    pub fn decrement(
        &mut self,
        name: &str,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.count(name, -1.0, tags, hostname, device_name)
    }

    /// Submit a raw value from an ever-increasing counter. The cycle's
    /// contribution is the sum of non-negative deltas between consecutive
    /// raw values; a decrease means the counter reset, re-baselines the
    /// context and contributes zero rather than a negative or spuriously
    /// large delta.
    pub fn monotonic_count(
        &mut self,
        name: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.submit(
            name,
            MetricKind::MonotonicCount,
            value,
            tags,
            hostname,
            device_name,
            None,
        )
    }

    /// Submit a point for a metric flushed as a rate. Two observations are
    /// needed before a point is produced, so the first call yields nothing
    /// at the next flush.
    pub fn rate(
        &mut self,
        name: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.submit(
            name,
            MetricKind::Rate,
            value,
            tags,
            hostname,
            device_name,
            None,
        )
    }

    /// Sample a histogram value.
    pub fn histogram(
        &mut self,
        name: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.submit(
            name,
            MetricKind::Histogram,
            value,
            tags,
            hostname,
            device_name,
            None,
        )
    }

    /// Sample a set value. The cycle's flush emits the number of unique
    /// values seen. Deprecated in favor of computing aggregates in the
    /// check and submitting a gauge; retained for compatibility.
    pub fn set(
        &mut self,
        name: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.submit(
            name,
            MetricKind::Set,
            value,
            tags,
            hostname,
            device_name,
            None,
        )
    }

    /// The number of points produced by the most recent flush.
    pub fn last_flush_count(&self) -> usize {
        self.last_flush_count
    }

    /// The number of live contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn submit(
        &mut self,
        name: &str,
        kind: MetricKind,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
        timestamp: Option<f64>,
    ) -> Result<(), Error> {
        if !value.is_finite() {
            return Err(Error::NaN(name.to_string()));
        }
        match self.kinds.get(name) {
            Some(existing) if *existing != kind => {
                // A name's kind is fixed by its first submission. Refusing
                // here keeps a series from silently changing semantics.
                warn!(
                    "dropping {} sample submitted as {:?}, already registered as {:?}",
                    name, kind, existing
                );
                return Ok(());
            }
            Some(_) => {}
            None => {
                self.kinds.insert(name.to_string(), kind);
            }
        }
        let now = time::now_f64();
        let ts = timestamp.unwrap_or(now);
        let key = ContextKey {
            name: name.to_string(),
            tags: tags.map(TagSet::from_slice).unwrap_or_default(),
            hostname: Some(hostname.unwrap_or(&self.hostname).to_string()),
            device_name: device_name.map(|d| d.to_string()),
        };
        let ctx = self.contexts.entry(key).or_insert_with(|| Context {
            value: Value::new(kind),
            last_seen: ts,
        });
        ctx.last_seen = ts;
        match ctx.value {
            Value::Gauge {
                value: ref mut v,
                timestamp: ref mut t,
            } => {
                *v = value;
                *t = ts;
            }
            Value::Count { value: ref mut v } => {
                *v = Some(v.unwrap_or(0.0) + value);
            }
            Value::MonotonicCount {
                ref mut delta,
                ref mut last_raw,
            } => {
                if let Some(last) = *last_raw {
                    let step = if value >= last { value - last } else { 0.0 };
                    *delta = Some(delta.unwrap_or(0.0) + step);
                }
                *last_raw = Some(value);
            }
            Value::Rate { ref mut samples } => {
                samples.push((ts, value));
                if samples.len() > 2 {
                    samples.remove(0);
                }
            }
            Value::Histogram(ref mut histo) => {
                histo.insert(value);
            }
            Value::Set { ref mut values } => {
                values.insert(value.to_bits());
            }
        }
        Ok(())
    }

    /// Drain the cycle into normalized points.
    ///
    /// Cycle-scoped accumulators (counts, histograms, sets, the rate
    /// baseline window) reset as a side effect; gauges persist and re-emit
    /// their last known value until expiry. Call exactly once per cycle
    /// boundary.
    pub fn flush(&mut self) -> Vec<Point> {
        self.flush_at(time::now_f64())
    }

    /// `flush` against an explicit clock. The seam tests use to drive
    /// expiry without waiting on the wall clock.
    pub fn flush_at(&mut self, now: f64) -> Vec<Point> {
        let expiry = self.expiry_seconds;
        let before = self.contexts.len();
        self.contexts.retain(|_, ctx| now - ctx.last_seen <= expiry);
        let purged = before - self.contexts.len();
        if purged > 0 {
            debug!("purged {} expired contexts", purged);
            let live: HashSet<String> =
                self.contexts.keys().map(|k| k.name.clone()).collect();
            self.kinds.retain(|name, _| live.contains(name));
        }

        let mut keys: Vec<ContextKey> = self.contexts.keys().cloned().collect();
        keys.sort();

        let mut points = Vec::new();
        for key in keys {
            if let Some(ctx) = self.contexts.get_mut(&key) {
                flush_context(&key, ctx, now, &self.aggregates, &self.percentiles, &mut points);
            }
        }
        self.last_flush_count = points.len();
        trace!("flushed {} points", points.len());
        points
    }
}

/// Reduce one context into zero or more points, resetting cycle state.
fn flush_context(
    key: &ContextKey,
    ctx: &mut Context,
    now: f64,
    aggregates: &[HistAggregate],
    percentiles: &[f64],
    points: &mut Vec<Point>,
) {
    let mk_point = |suffix: Option<&str>, ts: f64, value: f64, metric_type: &'static str| {
        let name = match suffix {
            Some(suffix) => format!("{}.{}", key.name, suffix),
            None => key.name.clone(),
        };
        Point {
            name: name,
            timestamp: ts as i64,
            value: value,
            attributes: Attributes {
                tags: key.tags.clone(),
                host_name: key.hostname.clone(),
                device_name: key.device_name.clone(),
                metric_type: Some(metric_type),
            },
        }
    };
    match ctx.value {
        Value::Gauge { value, timestamp } => {
            points.push(mk_point(None, timestamp, value, "gauge"));
        }
        Value::Count { ref mut value } => {
            if let Some(v) = value.take() {
                points.push(mk_point(None, now, v, "count"));
            }
        }
        Value::MonotonicCount {
            ref mut delta,
            last_raw: _,
        } => {
            if let Some(d) = delta.take() {
                points.push(mk_point(None, now, d, "count"));
            }
        }
        Value::Rate { ref mut samples } => {
            if samples.len() >= 2 {
                let (t1, v1) = samples[samples.len() - 2];
                let (t2, v2) = samples[samples.len() - 1];
                if t2 == t1 {
                    warn!("rate {} saw a zero time interval, dropping", key.name);
                } else if v2 < v1 {
                    // Counter reset; the newer sample becomes the baseline.
                    debug!("rate {} decreased, treating as counter reset", key.name);
                } else {
                    points.push(mk_point(None, t2, (v2 - v1) / (t2 - t1), "gauge"));
                }
                let newest = samples[samples.len() - 1];
                samples.clear();
                samples.push(newest);
            }
        }
        Value::Histogram(ref mut histo) => {
            if histo.count > 0 {
                for aggregate in aggregates {
                    let (value, metric_type) = match *aggregate {
                        HistAggregate::Min => (histo.min, "gauge"),
                        HistAggregate::Max => (histo.max, "gauge"),
                        HistAggregate::Median => {
                            (histo.ckms.query(0.5).map(|x| x.1).unwrap_or(histo.min), "gauge")
                        }
                        HistAggregate::Avg => (histo.sum / histo.count as f64, "gauge"),
                        HistAggregate::Sum => (histo.sum, "gauge"),
                        HistAggregate::Count => (histo.count as f64, "count"),
                    };
                    points.push(mk_point(Some(aggregate.suffix()), now, value, metric_type));
                }
                for p in percentiles {
                    if let Some((_, value)) = histo.ckms.query(*p) {
                        let suffix = format!("{}percentile", (p * 100.0).round() as i64);
                        points.push(mk_point(Some(&suffix), now, value, "gauge"));
                    }
                }
                *histo = Histo::new();
            }
        }
        Value::Set { ref mut values } => {
            if !values.is_empty() {
                points.push(mk_point(None, now, values.len() as f64, "gauge"));
                values.clear();
            }
        }
    }
}

/// Round configured percentiles to two digits and keep only those in the
/// open interval (0, 1).
fn sanitize_percentiles(raw: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = Vec::new();
    for p in raw {
        let rounded = (p * 100.0).round() / 100.0;
        if rounded > 0.0 && rounded < 1.0 {
            if !out.contains(&rounded) {
                out.push(rounded);
            }
        } else {
            warn!("dropping histogram percentile {}, must be in (0, 1)", p);
        }
    }
    out.sort_by(|a, b| a.partial_cmp(b).unwrap());
    out
}

//! The low-level sample store.
//!
//! This is the storage engine behind the legacy check interface: a metric is
//! declared as a gauge or a counter, samples are saved per context and the
//! newest well-formed value per context is read back out. Gauges retain a
//! single sample, counters retain the two most recent so a per-second rate
//! can be computed on read. The modern per-cycle engine lives in
//! `aggregator`.

use metric::{Attributes, Error, Point, TagSet};
use std::collections::{HashMap, HashSet};
use time;

/// Identity of a context within one declared metric: sorted tags plus the
/// optional device. The hostname rides on the sample itself, as the original
/// wire format keeps it out of the storage key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SampleKey {
    tags: TagSet,
    device_name: Option<String>,
}

/// A single retained observation.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Fractional epoch seconds of the observation.
    pub timestamp: f64,
    /// The observed value, or the computed rate for counter reads.
    pub value: f64,
    /// Hostname the sample was reported for, if any.
    pub hostname: Option<String>,
    /// Device the sample was reported for, if any.
    pub device_name: Option<String>,
}

/// Sample storage with per-kind retention rules.
///
/// # Examples
///
/// ```
/// use kestrel::store::SampleStore;
///
/// let mut store = SampleStore::new();
/// store.declare_gauge("cpu.idle");
/// store.save_sample("cpu.idle", 98.5, None, None, None, None).unwrap();
/// let sample = store.get_sample_with_timestamp("cpu.idle", None, None, true).unwrap();
/// assert_eq!(98.5, sample.value);
/// ```
#[derive(Debug, Default)]
pub struct SampleStore {
    store: HashMap<String, HashMap<SampleKey, Vec<Sample>>>,
    counters: HashSet<String>,
}

impl SampleStore {
    /// Create an empty store.
    pub fn new() -> SampleStore {
        SampleStore::default()
    }

    /// Register `metric` as a counter, clearing any stored samples.
    ///
    /// Re-declaring an existing gauge is legal and deliberately resets the
    /// metric's history along with its kind.
    pub fn declare_counter<S>(&mut self, metric: S)
    where
        S: Into<String>,
    {
        let metric = metric.into();
        self.counters.insert(metric.clone());
        self.store.insert(metric, HashMap::new());
    }

    /// Register `metric` as a gauge, clearing any stored samples.
    pub fn declare_gauge<S>(&mut self, metric: S)
    where
        S: Into<String>,
    {
        let metric = metric.into();
        self.counters.remove(&metric);
        self.store.insert(metric, HashMap::new());
    }

    /// Is this metric declared, of either kind?
    pub fn is_metric(&self, metric: &str) -> bool {
        self.store.contains_key(metric)
    }

    /// Is this metric a counter?
    pub fn is_counter(&self, metric: &str) -> bool {
        self.counters.contains(metric)
    }

    /// Is this metric a gauge?
    pub fn is_gauge(&self, metric: &str) -> bool {
        self.is_metric(metric) && !self.is_counter(metric)
    }

    /// All declared metric names.
    pub fn metric_names(&self) -> Vec<&str> {
        self.store.keys().map(|k| k.as_str()).collect()
    }

    /// Save a gauge value, declaring the metric if it is new.
    pub fn save_gauge(
        &mut self,
        metric: &str,
        value: f64,
        timestamp: Option<f64>,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        if !self.is_gauge(metric) {
            self.declare_gauge(metric);
        }
        self.save_sample(metric, value, timestamp, tags, hostname, device_name)
    }

    /// Save a sample, evicting old values according to the metric's kind.
    ///
    /// Gauge contexts hold exactly one sample, latest wins. Counter contexts
    /// hold the two most recent. Tags are sorted and deduplicated before
    /// they become part of the context key, so submission order never splits
    /// a series.
    pub fn save_sample(
        &mut self,
        metric: &str,
        value: f64,
        timestamp: Option<f64>,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        if !self.store.contains_key(metric) {
            return Err(Error::UndefinedMetric(metric.to_string()));
        }
        if !value.is_finite() {
            return Err(Error::NaN(metric.to_string()));
        }
        let sample = Sample {
            timestamp: timestamp.unwrap_or_else(time::now_f64),
            value: value,
            hostname: hostname.map(|h| h.to_string()),
            device_name: device_name.map(|d| d.to_string()),
        };
        let key = SampleKey {
            tags: tags.map(TagSet::from_slice).unwrap_or_default(),
            device_name: device_name.map(|d| d.to_string()),
        };
        let is_counter = self.counters.contains(metric);
        let contexts = match self.store.get_mut(metric) {
            Some(contexts) => contexts,
            None => return Err(Error::UndefinedMetric(metric.to_string())),
        };
        let samples = contexts.entry(key).or_insert_with(Vec::new);
        if is_counter {
            samples.push(sample);
            if samples.len() > 2 {
                let excess = samples.len() - 2;
                samples.drain(..excess);
            }
        } else {
            samples.clear();
            samples.push(sample);
        }
        Ok(())
    }

    /// Simple rate between two counter samples, carrying the newer sample's
    /// hostname and device.
    fn rate(older: &Sample, newer: &Sample) -> Result<Sample, Error> {
        let interval = newer.timestamp - older.timestamp;
        if interval == 0.0 {
            return Err(Error::Infinity);
        }
        let delta = newer.value - older.value;
        if delta < 0.0 {
            // Counter reset. The value is unavailable, not negative.
            return Err(Error::UnknownValue);
        }
        Ok(Sample {
            timestamp: newer.timestamp,
            value: delta / interval,
            hostname: newer.hostname.clone(),
            device_name: newer.device_name.clone(),
        })
    }

    fn read_context(&mut self, metric: &str, key: &SampleKey, expire: bool) -> Result<Sample, Error> {
        let is_counter = self.is_counter(metric);
        let samples = self.store
            .get_mut(metric)
            .ok_or(Error::UnknownValue)?
            .get_mut(key)
            .ok_or(Error::UnknownValue)?;
        if is_counter {
            if samples.len() < 2 {
                return Err(Error::UnknownValue);
            }
            let res = SampleStore::rate(&samples[samples.len() - 2], &samples[samples.len() - 1])?;
            if expire {
                let last = samples.len() - 1;
                samples.drain(..last);
            }
            Ok(res)
        } else {
            samples.last().cloned().ok_or(Error::UnknownValue)
        }
    }

    /// Read the newest well-formed sample for one context.
    ///
    /// For counters this computes `(v2 - v1) / (t2 - t1)` over the two
    /// retained samples, failing with `Infinity` on a zero interval and
    /// `UnknownValue` on a decrease (counter reset) or insufficient history.
    /// With `expire` set, all but the most recent raw sample are discarded
    /// after a successful read.
    pub fn get_sample_with_timestamp(
        &mut self,
        metric: &str,
        tags: Option<&[String]>,
        device_name: Option<&str>,
        expire: bool,
    ) -> Result<Sample, Error> {
        let key = SampleKey {
            tags: tags.map(TagSet::from_slice).unwrap_or_default(),
            device_name: device_name.map(|d| d.to_string()),
        };
        self.read_context(metric, &key, expire)
    }

    /// Read the newest well-formed value for one context.
    pub fn get_sample(
        &mut self,
        metric: &str,
        tags: Option<&[String]>,
        device_name: Option<&str>,
        expire: bool,
    ) -> Result<f64, Error> {
        self.get_sample_with_timestamp(metric, tags, device_name, expire)
            .map(|s| s.value)
    }

    /// All untagged contexts as `{metric: sample}`. Contexts without enough
    /// history are left out.
    pub fn get_samples_with_timestamps(&mut self, expire: bool) -> HashMap<String, Sample> {
        let names: Vec<String> = self.store.keys().cloned().collect();
        let mut values = HashMap::new();
        for m in names {
            if let Ok(sample) = self.get_sample_with_timestamp(&m, None, None, expire) {
                values.insert(m, sample);
            }
        }
        values
    }

    /// All untagged contexts as `{metric: value}`.
    pub fn get_samples(&mut self, expire: bool) -> HashMap<String, f64> {
        self.get_samples_with_timestamps(expire)
            .into_iter()
            .map(|(k, v)| (k, v.value))
            .collect()
    }

    /// Extract every context of every declared metric as normalized points.
    ///
    /// Contexts that cannot produce a value yet are skipped silently; "no
    /// data yet" is not an error at this layer. Attributes carry tags,
    /// hostname and device only when present.
    pub fn get_metrics(&mut self, expire: bool) -> Vec<Point> {
        let pairs: Vec<(String, SampleKey)> = self.store
            .iter()
            .flat_map(|(m, contexts)| {
                contexts.keys().map(move |k| (m.clone(), k.clone()))
            })
            .collect();
        let mut metrics = Vec::new();
        for (metric, key) in pairs {
            let sample = match self.read_context(&metric, &key, expire) {
                Ok(sample) => sample,
                Err(_) => continue,
            };
            let attributes = Attributes {
                tags: key.tags,
                host_name: sample.hostname,
                device_name: sample.device_name,
                metric_type: None,
            };
            metrics.push(Point {
                name: metric,
                timestamp: sample.timestamp as i64,
                value: sample.value,
                attributes: attributes,
            });
        }
        metrics
    }
}

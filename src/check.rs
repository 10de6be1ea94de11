//! The check runtime: the plugin trait, the submission surface handed to
//! running checks and the per-instance run loop.
//!
//! Each check owns its aggregator, so no cross-check context collisions are
//! possible. The aggregator sits behind a mutex taken per operation; a
//! listener thread may feed it while the collection thread reads, without
//! either blocking the other for a whole cycle.

use aggregator::{ContextKey, HistAggregate, MetricsAggregator, DEFAULT_EXPIRY_SECONDS};
use metric::{Error, Event, Point, ServiceCheck, ServiceStatus, TagSet};
use status::{InstanceStats, InstanceStatus};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use time;
use toml;

/// One configuration block from a check's `instances` list.
pub type Instance = toml::value::Table;

/// A failure raised by a check's logic for one instance.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckError {
    /// Operator-facing failure message.
    pub message: String,
    /// Captured detail, the closest thing to a stack trace the failure
    /// carried.
    pub detail: Option<String>,
}

impl CheckError {
    /// Make a failure from a message.
    pub fn new<S>(message: S) -> CheckError
    where
        S: Into<String>,
    {
        CheckError {
            message: message.into(),
            detail: None,
        }
    }

    /// Attach captured detail to the failure.
    pub fn detail<S>(mut self, detail: S) -> CheckError
    where
        S: Into<String>,
    {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ::std::error::Error for CheckError {
    fn description(&self) -> &str {
        "check error"
    }
}

impl From<Error> for CheckError {
    fn from(e: Error) -> CheckError {
        CheckError::new(format!("{}", e)).detail(format!("{:?}", e))
    }
}

/// The capability interface a check plugin implements.
///
/// Checks are driven by a `CheckRunner`, which calls `check` once per
/// configured instance per cycle. Output goes through the `Sender`'s
/// submission verbs; a raised failure isolates that instance only.
pub trait Check: Send {
    /// Run the check against one instance configuration.
    fn check(&mut self, sender: &mut Sender, instance: &Instance) -> Result<(), CheckError>;

    /// Versions of the libraries this check drives, for the status page.
    fn library_versions(&self) -> Option<HashMap<String, String>> {
        None
    }

    /// Tags for hosts other than the agent's own, collected periodically.
    fn external_host_tags(&self) -> Vec<(String, Vec<String>)> {
        Vec::new()
    }

    /// Release resources when the agent is being stopped.
    fn stop(&mut self) {}
}

/// The submission surface a running check writes into: the check's own
/// aggregator plus the event, service check, warning and metadata buffers.
/// Every buffer drains once per cycle; a second read returns empty.
pub struct Sender {
    hostname: String,
    aggregator: Arc<Mutex<MetricsAggregator>>,
    events: Vec<Event>,
    service_checks: Vec<ServiceCheck>,
    warnings: Vec<String>,
    instance_metadata: Vec<(String, String)>,
    svc_metadata: Vec<HashMap<String, String>>,
    historates: HashMap<ContextKey, (f64, f64)>,
}

impl Sender {
    fn new(hostname: &str, aggregator: MetricsAggregator) -> Sender {
        Sender {
            hostname: hostname.to_string(),
            aggregator: Arc::new(Mutex::new(aggregator)),
            events: Vec::new(),
            service_checks: Vec::new(),
            warnings: Vec::new(),
            instance_metadata: Vec::new(),
            svc_metadata: Vec::new(),
            historates: HashMap::new(),
        }
    }

    /// A handle on this check's aggregator, for listeners that feed it from
    /// another thread. The lock is taken per operation, never for a whole
    /// cycle.
    pub fn aggregator(&self) -> Arc<Mutex<MetricsAggregator>> {
        Arc::clone(&self.aggregator)
    }

    fn with_aggregator<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut MetricsAggregator) -> Result<(), Error>,
    {
        let mut aggregator = self.aggregator.lock().expect("aggregator lock poisoned");
        f(&mut aggregator)
    }

    /// Record a gauge value.
    pub fn gauge(
        &mut self,
        metric: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
        timestamp: Option<f64>,
    ) -> Result<(), Error> {
        self.with_aggregator(|a| a.gauge(metric, value, tags, hostname, device_name, timestamp))
    }

    /// Add to this cycle's running sum for the context.
    pub fn count(
        &mut self,
        metric: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.with_aggregator(|a| a.count(metric, value, tags, hostname, device_name))
    }

    /// Increment a counter by one.
    pub fn increment(
        &mut self,
        metric: &str,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.with_aggregator(|a| a.increment(metric, tags, hostname, device_name))
    }

    /// Decrement a counter by one.
    pub fn decrement(
        &mut self,
        metric: &str,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.with_aggregator(|a| a.decrement(metric, tags, hostname, device_name))
    }

    /// Submit a raw ever-increasing counter value; resets tolerated.
    pub fn monotonic_count(
        &mut self,
        metric: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.with_aggregator(|a| a.monotonic_count(metric, value, tags, hostname, device_name))
    }

    /// Submit a point for a metric flushed as a rate.
    pub fn rate(
        &mut self,
        metric: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.with_aggregator(|a| a.rate(metric, value, tags, hostname, device_name))
    }

    /// Sample a histogram value.
    pub fn histogram(
        &mut self,
        metric: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.with_aggregator(|a| a.histogram(metric, value, tags, hostname, device_name))
    }

    /// Sample a set value; the flush emits the cycle's cardinality.
    pub fn set(
        &mut self,
        metric: &str,
        value: f64,
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        self.warning(
            "the `set` verb is deprecated, compute aggregates in the check and submit a gauge",
        );
        self.with_aggregator(|a| a.set(metric, value, tags, hostname, device_name))
    }

    /// Histogram over the rate of a raw counter-like value.
    ///
    /// Keeps the last `(value, timestamp)` per context; from the second call
    /// on, the rate between the stored and submitted value feeds the
    /// histogram for `metric`. Tags matching an excluded key are filtered
    /// out of both the rolling-window key and the emitted tag set, on every
    /// call. The window re-stores `(value, now)` whether or not a rate was
    /// emitted.
    pub fn historate(
        &mut self,
        metric: &str,
        value: f64,
        excluding_tags: &[String],
        tags: Option<&[String]>,
        hostname: Option<&str>,
        device_name: Option<&str>,
    ) -> Result<(), Error> {
        if !value.is_finite() {
            return Err(Error::NaN(metric.to_string()));
        }
        let mut kept = TagSet::default();
        if let Some(tags) = tags {
            kept = TagSet::from_slice(tags);
            kept.retain(|tag| {
                !excluding_tags
                    .iter()
                    .any(|exc| tag.starts_with(&format!("{}:", exc)))
            });
        }
        let key = ContextKey {
            name: metric.to_string(),
            tags: kept.clone(),
            hostname: hostname.map(|h| h.to_string()),
            device_name: device_name.map(|d| d.to_string()),
        };
        let now = time::now_f64();
        let previous = self.historates.insert(key, (value, now));
        if let Some((prev_value, prev_ts)) = previous {
            if now == prev_ts {
                debug!("historate {} saw a zero time interval, dropping", metric);
                return Ok(());
            }
            let rate = (value - prev_value) / (now - prev_ts);
            let kept = kept.into_vec();
            return self.histogram(metric, rate, Some(&kept), hostname, device_name);
        }
        Ok(())
    }

    /// Save a service check record. Tags are sorted and deduplicated; the
    /// agent's hostname is attached when none is given.
    pub fn service_check(
        &mut self,
        check_name: &str,
        status: ServiceStatus,
        tags: Option<&[String]>,
        timestamp: Option<f64>,
        hostname: Option<&str>,
        message: Option<&str>,
    ) {
        let mut record = ServiceCheck::new(check_name, status)
            .host_name(hostname.unwrap_or(&self.hostname));
        if let Some(tags) = tags {
            record = record.tags(tags);
        }
        if let Some(ts) = timestamp {
            record = record.timestamp(ts);
        }
        if let Some(message) = message {
            record = record.message(message);
        }
        self.service_checks.push(record);
    }

    /// Save an event.
    pub fn event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Add a warning to the running instance's status, also logged.
    pub fn warning<S>(&mut self, message: S)
    where
        S: Into<String>,
    {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }

    /// Save a metadata key for the running instance.
    pub fn service_metadata<S>(&mut self, name: S, value: S)
    where
        S: Into<String>,
    {
        self.instance_metadata.push((name.into(), value.into()));
    }

    /// Whether the running instance accumulated warnings.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Drain the running instance's warnings.
    pub fn get_warnings(&mut self) -> Vec<String> {
        ::std::mem::replace(&mut self.warnings, Vec::new())
    }

    /// Fold the running instance's metadata into the per-instance record
    /// list, leaving a clean slate for the next instance.
    fn roll_up_instance_metadata(&mut self) {
        let pairs = ::std::mem::replace(&mut self.instance_metadata, Vec::new());
        self.svc_metadata.push(pairs.into_iter().collect());
    }

    /// Flush this check's aggregator into normalized points.
    pub fn get_metrics(&mut self) -> Vec<Point> {
        let mut aggregator = self.aggregator.lock().expect("aggregator lock poisoned");
        aggregator.flush()
    }

    /// Drain the events saved since the last call.
    pub fn get_events(&mut self) -> Vec<Event> {
        ::std::mem::replace(&mut self.events, Vec::new())
    }

    /// Drain the service checks saved since the last call.
    pub fn get_service_checks(&mut self) -> Vec<ServiceCheck> {
        ::std::mem::replace(&mut self.service_checks, Vec::new())
    }

    /// Drain the per-instance metadata records saved since the last call.
    pub fn get_service_metadata(&mut self) -> Vec<HashMap<String, String>> {
        if !self.instance_metadata.is_empty() {
            self.roll_up_instance_metadata();
        }
        ::std::mem::replace(&mut self.svc_metadata, Vec::new())
    }
}

/// Configuration a runner needs from the agent.
#[derive(Clone, Debug)]
pub struct CheckConfig {
    /// The agent's hostname, attached to submissions by default.
    pub hostname: String,
    /// The check's `init_config` block.
    pub init_config: Instance,
    /// One configuration block per instance.
    pub instances: Vec<Instance>,
    /// Seconds an instance must wait between runs unless overridden.
    pub min_collection_interval: f64,
    /// Histogram statistics enabled at flush.
    pub histogram_aggregates: Vec<HistAggregate>,
    /// Histogram percentiles enabled at flush.
    pub histogram_percentiles: Vec<f64>,
    /// Time instance runs and record run statistics.
    pub developer_mode: bool,
    /// Version of the check, for status reporting.
    pub version: Option<String>,
}

impl CheckConfig {
    /// Defaults for a host: no instances, no throttling, default histogram
    /// configuration.
    pub fn new(hostname: &str) -> CheckConfig {
        CheckConfig {
            hostname: hostname.to_string(),
            init_config: Instance::new(),
            instances: vec![Instance::new()],
            min_collection_interval: 0.0,
            histogram_aggregates: HistAggregate::defaults(),
            histogram_percentiles: vec![0.95],
            developer_mode: false,
            version: None,
        }
    }

    /// Replace the instance list.
    pub fn instances(mut self, instances: Vec<Instance>) -> CheckConfig {
        self.instances = instances;
        self
    }
}

/// Read a seconds value out of a TOML table, accepting both integer and
/// float notation.
fn interval_from(table: &Instance, key: &str) -> Option<f64> {
    match table.get(key) {
        Some(&toml::Value::Integer(i)) => Some(i as f64),
        Some(&toml::Value::Float(f)) => Some(f),
        _ => None,
    }
}

/// Drives one check through its configured instances, isolating failures
/// and recording one status per instance per run.
pub struct CheckRunner {
    /// The check's name.
    pub name: String,
    /// Source type reported upstream; defaults to the check name.
    pub source_type_name: String,
    check: Box<dyn Check>,
    sender: Sender,
    instances: Vec<Instance>,
    min_collection_interval: f64,
    last_collection_time: Vec<f64>,
    developer_mode: bool,
    check_version: Option<String>,
    library_versions: Option<HashMap<String, String>>,
}

impl CheckRunner {
    /// Wire a check up to its own aggregator and scheduling state.
    pub fn new(name: &str, check: Box<dyn Check>, config: CheckConfig) -> CheckRunner {
        let min_collection_interval = interval_from(&config.init_config, "min_collection_interval")
            .unwrap_or(config.min_collection_interval);
        let aggregator = MetricsAggregator::with_options(
            &config.hostname,
            min_collection_interval + DEFAULT_EXPIRY_SECONDS,
            config.histogram_aggregates.clone(),
            &config.histogram_percentiles,
        );
        let instance_count = config.instances.len();
        CheckRunner {
            name: name.to_string(),
            source_type_name: name.to_string(),
            check: check,
            sender: Sender::new(&config.hostname, aggregator),
            instances: config.instances,
            min_collection_interval: min_collection_interval,
            last_collection_time: vec![0.0; instance_count],
            developer_mode: config.developer_mode,
            check_version: config.version,
            library_versions: None,
        }
    }

    /// The number of instances configured for this check.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Version of the check, for status reporting.
    pub fn check_version(&self) -> Option<String> {
        self.check_version.clone()
    }

    /// Run all instances, one status each.
    ///
    /// Throttled instances are recorded as `Skipped`. A failing instance is
    /// recorded as `Error` with its message and detail, and never aborts
    /// the run of sibling instances. After every instance the accumulated
    /// metadata is rolled up and leftover warnings are discarded so the
    /// next instance starts clean.
    pub fn run(&mut self) -> Vec<InstanceStatus> {
        let mut statuses = Vec::with_capacity(self.instances.len());
        for i in 0..self.instances.len() {
            let min_interval =
                interval_from(&self.instances[i], "min_collection_interval")
                    .unwrap_or(self.min_collection_interval);
            let now = time::now_f64();
            if now - self.last_collection_time[i] < min_interval {
                debug!(
                    "not running instance #{} of check {}, ran less than {}s ago",
                    i, self.name, min_interval
                );
                // Roll up the (empty) metadata slot anyway so metadata
                // records stay aligned with instance statuses downstream.
                self.sender.roll_up_instance_metadata();
                statuses.push(InstanceStatus::skipped(i));
                continue;
            }
            self.last_collection_time[i] = now;

            let start = if self.developer_mode {
                Some(Instant::now())
            } else {
                None
            };
            let result = self.check.check(&mut self.sender, &self.instances[i]);
            let stats = start.map(|s| InstanceStats {
                run_time: time::elapsed_ns(s) as f64 / 1e9,
            });

            let status = match result {
                Ok(()) => {
                    if self.sender.has_warnings() {
                        InstanceStatus::warning(i, self.sender.get_warnings(), stats)
                    } else {
                        InstanceStatus::ok(i, stats)
                    }
                }
                Err(e) => {
                    error!("check '{}' instance #{} failed: {}", self.name, i, e);
                    InstanceStatus::error(i, e.message, e.detail)
                }
            };
            self.sender.roll_up_instance_metadata();
            // Discard any remaining warnings so the next instance starts
            // clean, even after a failure left state behind.
            self.sender.get_warnings();
            statuses.push(status);
        }
        statuses
    }

    /// Flush this check's aggregator into normalized points.
    pub fn get_metrics(&mut self) -> Vec<Point> {
        self.sender.get_metrics()
    }

    /// Drain the events saved since the last call.
    pub fn get_events(&mut self) -> Vec<Event> {
        self.sender.get_events()
    }

    /// Drain the service checks saved since the last call.
    pub fn get_service_checks(&mut self) -> Vec<ServiceCheck> {
        self.sender.get_service_checks()
    }

    /// Drain the per-instance metadata saved since the last call.
    pub fn get_service_metadata(&mut self) -> Vec<HashMap<String, String>> {
        self.sender.get_service_metadata()
    }

    /// Append a service check on this check's behalf. Used by the collector
    /// for the derived per-check status record.
    pub fn service_check(
        &mut self,
        check_name: &str,
        status: ServiceStatus,
        tags: Option<&[String]>,
    ) {
        self.sender
            .service_check(check_name, status, tags, None, None, None);
    }

    /// The check's library versions, fetched once and cached.
    pub fn library_info(&mut self) -> Option<HashMap<String, String>> {
        if self.library_versions.is_none() {
            self.library_versions = self.check.library_versions();
        }
        self.library_versions.clone()
    }

    /// Tags for hosts other than the agent's own.
    pub fn external_host_tags(&self) -> Vec<(String, Vec<String>)> {
        self.check.external_host_tags()
    }

    /// A handle on this check's aggregator for listener threads.
    pub fn aggregator(&self) -> Arc<Mutex<MetricsAggregator>> {
        self.sender.aggregator()
    }

    /// Tell the check to release its resources.
    pub fn stop(&mut self) {
        self.check.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use metric::ServiceStatus;
    use status::Status;

    /// A check scripted per instance: fail on listed indexes, warn on
    /// listed indexes, gauge one point otherwise.
    struct Scripted {
        fail_on: Vec<usize>,
        warn_on: Vec<usize>,
        calls: usize,
    }

    impl Scripted {
        fn new(fail_on: Vec<usize>, warn_on: Vec<usize>) -> Scripted {
            Scripted {
                fail_on: fail_on,
                warn_on: warn_on,
                calls: 0,
            }
        }
    }

    impl Check for Scripted {
        fn check(&mut self, sender: &mut Sender, _instance: &Instance) -> Result<(), CheckError> {
            let i = self.calls;
            self.calls += 1;
            if self.fail_on.contains(&i) {
                return Err(CheckError::new("scripted failure").detail("at instance"));
            }
            if self.warn_on.contains(&i) {
                sender.warning(format!("scripted warning #{}", i));
            }
            sender
                .count(&format!("scripted.instance_{}", i), 1.0, None, None, None)
                .map_err(CheckError::from)?;
            Ok(())
        }
    }

    fn two_instances() -> CheckConfig {
        CheckConfig::new("test-host").instances(vec![Instance::new(), Instance::new()])
    }

    #[test]
    fn failure_on_one_instance_does_not_abort_siblings() {
        let mut runner = CheckRunner::new(
            "scripted",
            Box::new(Scripted::new(vec![0], vec![])),
            two_instances(),
        );
        let statuses = runner.run();
        assert_eq!(2, statuses.len());
        assert_eq!(Status::Error, statuses[0].status);
        assert_eq!(Some("scripted failure".to_string()), statuses[0].error);
        assert!(statuses[0].trace.is_some());
        assert_eq!(Status::Ok, statuses[1].status);
        // Instance 1 still delivered its point.
        let metrics = runner.get_metrics();
        assert_eq!(1, metrics.len());
        assert_eq!("scripted.instance_1", metrics[0].name);
    }

    #[test]
    fn warnings_attach_to_their_instance_only() {
        let mut runner = CheckRunner::new(
            "scripted",
            Box::new(Scripted::new(vec![], vec![0])),
            two_instances(),
        );
        let statuses = runner.run();
        assert_eq!(Status::Warning, statuses[0].status);
        assert_eq!(vec!["scripted warning #0".to_string()], statuses[0].warnings);
        assert_eq!(Status::Ok, statuses[1].status);
        assert!(statuses[1].warnings.is_empty());
    }

    #[test]
    fn throttled_instances_are_skipped_explicitly() {
        let mut config = two_instances();
        config.min_collection_interval = 3600.0;
        let mut runner = CheckRunner::new(
            "scripted",
            Box::new(Scripted::new(vec![], vec![])),
            config,
        );
        let first = runner.run();
        assert!(first.iter().all(|s| s.status == Status::Ok));
        let second = runner.run();
        assert!(second.iter().all(|s| s.status == Status::Skipped));
        // A skipped instance submits nothing.
        runner.get_metrics();
        assert!(runner.get_metrics().is_empty());
    }

    #[test]
    fn instance_interval_overrides_check_interval() {
        let mut fast = Instance::new();
        fast.insert(
            "min_collection_interval".to_string(),
            toml::Value::Integer(0),
        );
        let mut config = CheckConfig::new("test-host").instances(vec![fast, Instance::new()]);
        config.min_collection_interval = 3600.0;
        let mut runner = CheckRunner::new(
            "scripted",
            Box::new(Scripted::new(vec![], vec![])),
            config,
        );
        runner.run();
        let second = runner.run();
        assert_eq!(Status::Ok, second[0].status);
        assert_eq!(Status::Skipped, second[1].status);
    }

    #[test]
    fn drains_return_contents_once() {
        struct Emitting;
        impl Check for Emitting {
            fn check(&mut self, sender: &mut Sender, _: &Instance) -> Result<(), CheckError> {
                sender.count("c", 1.0, None, None, None)?;
                sender.event(::metric::Event::new("deploy", "deployed", "v2 is live"));
                sender.service_check("svc", ServiceStatus::Ok, None, None, None, None);
                sender.service_metadata("version", "2.0");
                Ok(())
            }
        }
        let mut runner = CheckRunner::new(
            "emitting",
            Box::new(Emitting),
            CheckConfig::new("test-host"),
        );
        runner.run();
        assert_eq!(1, runner.get_metrics().len());
        assert!(runner.get_metrics().is_empty());
        assert_eq!(1, runner.get_events().len());
        assert!(runner.get_events().is_empty());
        assert_eq!(1, runner.get_service_checks().len());
        assert!(runner.get_service_checks().is_empty());
        let metadata = runner.get_service_metadata();
        assert_eq!(1, metadata.len());
        assert_eq!(Some(&"2.0".to_string()), metadata[0].get("version"));
        assert!(runner.get_service_metadata().is_empty());
    }

    #[test]
    fn metadata_rolls_up_per_instance() {
        struct PerInstance {
            calls: usize,
        }
        impl Check for PerInstance {
            fn check(&mut self, sender: &mut Sender, _: &Instance) -> Result<(), CheckError> {
                sender.service_metadata("index", &format!("{}", self.calls));
                self.calls += 1;
                Ok(())
            }
        }
        let mut runner = CheckRunner::new(
            "meta",
            Box::new(PerInstance { calls: 0 }),
            two_instances(),
        );
        runner.run();
        let metadata = runner.get_service_metadata();
        assert_eq!(2, metadata.len());
        assert_eq!(Some(&"0".to_string()), metadata[0].get("index"));
        assert_eq!(Some(&"1".to_string()), metadata[1].get("index"));
    }

    #[test]
    fn historate_rolls_a_two_point_window() {
        let mut sender = Sender::new("test-host", MetricsAggregator::new("test-host"));
        let tags = vec!["queue:q1".to_string(), "node:a".to_string()];
        let excluding = vec!["node".to_string()];
        sender
            .historate("q.depth", 10.0, &excluding, Some(&tags), None, None)
            .unwrap();
        // First call primes the window; nothing reaches the histogram.
        assert!(sender.get_metrics().is_empty());
        ::std::thread::sleep(::std::time::Duration::from_millis(5));
        sender
            .historate("q.depth", 30.0, &excluding, Some(&tags), None, None)
            .unwrap();
        let metrics = sender.get_metrics();
        assert!(!metrics.is_empty());
        for point in &metrics {
            assert!(point.name.starts_with("q.depth."));
            assert!(point.attributes.tags.contains("queue:q1"));
            assert!(!point.attributes.tags.contains("node:a"));
        }
    }

    #[test]
    fn historate_exclusion_applies_to_the_window_key() {
        // Submissions differing only in an excluded tag share one window.
        let mut sender = Sender::new("test-host", MetricsAggregator::new("test-host"));
        let excluding = vec!["node".to_string()];
        let a = vec!["node:a".to_string()];
        let b = vec!["node:b".to_string()];
        sender
            .historate("q.depth", 10.0, &excluding, Some(&a), None, None)
            .unwrap();
        ::std::thread::sleep(::std::time::Duration::from_millis(5));
        sender
            .historate("q.depth", 30.0, &excluding, Some(&b), None, None)
            .unwrap();
        assert!(!sender.get_metrics().is_empty());
    }

    #[test]
    fn set_verb_warns_deprecation() {
        struct Setter;
        impl Check for Setter {
            fn check(&mut self, sender: &mut Sender, _: &Instance) -> Result<(), CheckError> {
                sender.set("uniq", 1.0, None, None, None)?;
                Ok(())
            }
        }
        let mut runner =
            CheckRunner::new("setter", Box::new(Setter), CheckConfig::new("test-host"));
        let statuses = runner.run();
        assert_eq!(Status::Warning, statuses[0].status);
        assert_eq!(1, runner.get_metrics().len());
    }

    #[test]
    fn service_check_defaults_hostname() {
        let mut sender = Sender::new("agent-host", MetricsAggregator::new("agent-host"));
        sender.service_check("svc", ServiceStatus::Critical, None, None, None, Some("down"));
        let checks = sender.get_service_checks();
        assert_eq!(Some("agent-host".to_string()), checks[0].host_name);
        assert_eq!(Some("down".to_string()), checks[0].message);
        assert_eq!(2, checks[0].status.as_u8());
    }
}

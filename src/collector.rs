//! The collector loop: one full collection cycle across built-in system
//! checks and every configured check, merged into a payload for the
//! transmission boundary.
//!
//! The cycle is single-threaded by design; checks run one after another so
//! nothing races on the shared payload. Real concurrency only exists at the
//! aggregator boundary, which each check guards with its own lock.

use check::{Check, CheckError, CheckRunner, Instance, Sender};
use config::Args;
use emitter::{Emitter, COMMON_ENDPOINT, DATA_ENDPOINT, METADATA_ENDPOINT};
use metric::{Event, Point, ServiceCheck, ServiceStatus, TagSet};
use serde_json;
use serde_json::{Map, Value};
use status::{CheckStatus, EmitterStatus, InitFailure, Status};
use std::collections::HashMap;
use std::env::consts;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use time;
use uuid::Uuid;

/// The check that must run last so it can observe the cycle's own timings.
pub const AGENT_METRICS_CHECK_NAME: &'static str = "agent_metrics";

/// Log cycle summaries at info level for this many initial runs.
const FLUSH_LOGGING_INITIAL: u64 = 5;
/// After the initial runs, log a cycle summary at info level every this
/// many runs.
const FLUSH_LOGGING_PERIOD: u64 = 10;

/// Payload keys routed to the metadata sub-payload.
const METADATA_KEYS: &'static [&'static str] = &[
    "meta",
    "tags",
    "host-tags",
    "systemStats",
    "agent_checks",
    "external_host_tags",
];

/// Payload keys present in both sub-payloads so each identifies its origin.
const DUPLICATE_KEYS: &'static [&'static str] = &["agentVersion", "internalHostname"];

/// One payload interface over two payloads: a data payload carrying
/// metrics, events and service checks, and a metadata payload refreshed on
/// slower timers. Depending on the transmission mode they are merged into
/// one map or delivered to separate endpoints.
#[derive(Clone, Debug, Default)]
pub struct AgentPayload {
    data: Map<String, Value>,
    meta: Map<String, Value>,
}

impl AgentPayload {
    /// An empty payload pair.
    pub fn new() -> AgentPayload {
        AgentPayload::default()
    }

    /// Store `value` under `key`, routed to the data or metadata payload
    /// by the fixed key set. Duplicate keys land in both.
    pub fn insert<S>(&mut self, key: S, value: Value)
    where
        S: Into<String>,
    {
        let key = key.into();
        if DUPLICATE_KEYS.contains(&key.as_str()) {
            self.data.insert(key.clone(), value.clone());
            self.meta.insert(key, value);
        } else if METADATA_KEYS.contains(&key.as_str()) {
            self.meta.insert(key, value);
        } else {
            self.data.insert(key, value);
        }
    }

    /// Fetch a value from whichever payload holds `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if METADATA_KEYS.contains(&key) {
            self.meta.get(key)
        } else {
            self.data.get(key)
        }
    }

    /// Total number of keys across both payloads.
    pub fn len(&self) -> usize {
        self.data.len() + self.meta.len()
    }

    /// True when nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.meta.is_empty()
    }

    /// The data sub-payload.
    pub fn data_payload(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// The metadata sub-payload.
    pub fn meta_payload(&self) -> Value {
        Value::Object(self.meta.clone())
    }

    /// A single payload with the content of both.
    pub fn merged(&self) -> Value {
        let mut merged = self.data.clone();
        for (k, v) in &self.meta {
            merged.insert(k.clone(), v.clone());
        }
        Value::Object(merged)
    }

    /// Hand the payload to every emitter, either merged to the common
    /// endpoint or split across the data and metadata endpoints. Stops
    /// early when the continue flag clears.
    pub fn emit(
        &self,
        emitters: &mut Vec<Box<dyn Emitter>>,
        continue_running: &AtomicBool,
        merge_payloads: bool,
    ) -> Vec<EmitterStatus> {
        let mut statuses = Vec::new();
        if merge_payloads {
            emit_one(
                &self.merged(),
                COMMON_ENDPOINT,
                emitters,
                continue_running,
                &mut statuses,
            );
        } else {
            emit_one(
                &self.data_payload(),
                DATA_ENDPOINT,
                emitters,
                continue_running,
                &mut statuses,
            );
            emit_one(
                &self.meta_payload(),
                METADATA_ENDPOINT,
                emitters,
                continue_running,
                &mut statuses,
            );
        }
        statuses
    }
}

fn emit_one(
    payload: &Value,
    endpoint: &str,
    emitters: &mut Vec<Box<dyn Emitter>>,
    continue_running: &AtomicBool,
    statuses: &mut Vec<EmitterStatus>,
) {
    for emitter in emitters.iter_mut() {
        // Don't hand work to an emitter while stopping; the forwarder on
        // the other side is likely already gone.
        if !continue_running.load(Ordering::SeqCst) {
            return;
        }
        match emitter.deliver(payload, endpoint) {
            Ok(()) => statuses.push(EmitterStatus::ok(emitter.name())),
            Err(e) => {
                error!("error running emitter {}: {}", emitter.name(), e);
                statuses.push(EmitterStatus::failed(emitter.name(), e));
            }
        }
    }
}

/// A built-in OS-level collector run best-effort at the top of each cycle.
/// Results merge into the payload as top-level entries; a failure is logged
/// and means only that this data is missing this cycle.
pub trait SystemCheck: Send {
    /// The collector's name, for logging.
    fn name(&self) -> &str;

    /// Collect system-level data as payload entries.
    fn check(&mut self) -> Result<Map<String, Value>, String>;
}

/// This cycle's own timings, observed by the agent-metrics check.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimingContext {
    /// Seconds the cycle spent collecting.
    pub collection_time: Option<f64>,
    /// Seconds the previous cycle spent emitting.
    pub emit_time: Option<f64>,
}

/// Shared slot the collector writes timings into before the agent-metrics
/// check runs.
pub type TimingHandle = Arc<Mutex<Option<TimingContext>>>;

/// The built-in check reporting the agent's own performance. Registered
/// under `AGENT_METRICS_CHECK_NAME` it is excluded from the generic check
/// loop and run last, once this cycle's collection timing is known.
pub struct AgentMetricsCheck {
    context: TimingHandle,
}

impl AgentMetricsCheck {
    /// A fresh check with an empty timing slot.
    pub fn new() -> AgentMetricsCheck {
        AgentMetricsCheck {
            context: Arc::new(Mutex::new(None)),
        }
    }

    /// The handle the collector uses to pass timings in.
    pub fn context_handle(&self) -> TimingHandle {
        Arc::clone(&self.context)
    }
}

impl Default for AgentMetricsCheck {
    fn default() -> AgentMetricsCheck {
        AgentMetricsCheck::new()
    }
}

impl Check for AgentMetricsCheck {
    fn check(&mut self, sender: &mut Sender, _instance: &Instance) -> Result<(), CheckError> {
        let context = self
            .context
            .lock()
            .expect("timing context lock poisoned")
            .take();
        if let Some(context) = context {
            if let Some(collection_time) = context.collection_time {
                sender.gauge(
                    "kestrel.agent.collection_time",
                    collection_time,
                    None,
                    None,
                    None,
                    None,
                )?;
            }
            if let Some(emit_time) = context.emit_time {
                sender.gauge("kestrel.agent.emit_time", emit_time, None, None, None, None)?;
            }
        }
        Ok(())
    }
}

struct PushTime {
    start: f64,
    interval: f64,
}

/// The outcome of one collection cycle.
#[derive(Debug)]
pub struct CycleStatus {
    /// The assembled payload, as handed to the emitters.
    pub payload: AgentPayload,
    /// One status per configured check.
    pub check_statuses: Vec<CheckStatus>,
    /// One status per emitter delivery.
    pub emitter_statuses: Vec<EmitterStatus>,
    /// Seconds spent collecting.
    pub collect_duration: f64,
    /// Seconds spent emitting.
    pub emit_duration: f64,
}

/// Collects data from every check once per cycle and passes it along to
/// the emitters.
pub struct Collector {
    hostname: String,
    version: String,
    host_tags: Vec<String>,
    check_timings: bool,
    merge_payloads: bool,
    emitters: Vec<Box<dyn Emitter>>,
    system_checks: Vec<Box<dyn SystemCheck>>,
    checks: Vec<CheckRunner>,
    init_failed: HashMap<String, InitFailure>,
    agent_metrics: Option<CheckRunner>,
    timing_handle: Option<TimingHandle>,
    push_times: HashMap<&'static str, PushTime>,
    run_count: u64,
    continue_running: Arc<AtomicBool>,
    emit_duration: Option<f64>,
    hostname_metadata_cache: Option<Value>,
}

impl Collector {
    /// Build a collector from the agent configuration. Emitters, system
    /// checks and check runners are registered afterwards.
    pub fn new(config: &Args) -> Collector {
        let now = time::now_f64();
        let mut push_times = HashMap::new();
        push_times.insert(
            "host_metadata",
            PushTime {
                start: now,
                interval: config.metadata_interval as f64,
            },
        );
        // Give checks a few cycles to settle before the first periodic
        // external-host-tags refresh.
        push_times.insert(
            "external_host_tags",
            PushTime {
                start: now - 3.0 * 60.0,
                interval: config.external_host_tags_interval as f64,
            },
        );
        push_times.insert(
            "agent_checks",
            PushTime {
                start: now,
                interval: config.agent_checks_interval as f64,
            },
        );
        Collector {
            hostname: config.hostname.clone(),
            version: config.version.clone(),
            host_tags: config.tags.clone(),
            check_timings: config.check_timings,
            merge_payloads: config.merge_payloads,
            emitters: Vec::new(),
            system_checks: Vec::new(),
            checks: Vec::new(),
            init_failed: HashMap::new(),
            agent_metrics: None,
            timing_handle: None,
            push_times: push_times,
            run_count: 0,
            continue_running: Arc::new(AtomicBool::new(true)),
            emit_duration: None,
            hostname_metadata_cache: None,
        }
    }

    /// Register an emitter.
    pub fn add_emitter(&mut self, emitter: Box<dyn Emitter>) {
        self.emitters.push(emitter);
    }

    /// Register a built-in system check.
    pub fn add_system_check(&mut self, check: Box<dyn SystemCheck>) {
        self.system_checks.push(check);
    }

    /// Register a configured check.
    pub fn add_check(&mut self, runner: CheckRunner) {
        self.checks.push(runner);
    }

    /// Register the agent-metrics check, kept out of the generic loop and
    /// run last with this cycle's timings.
    pub fn set_agent_metrics(&mut self, runner: CheckRunner, handle: TimingHandle) {
        self.agent_metrics = Some(runner);
        self.timing_handle = Some(handle);
    }

    /// Record a check that failed to initialize. It is reported every
    /// cycle but never enters the run loop.
    pub fn record_init_failure<S>(&mut self, name: S, failure: InitFailure)
    where
        S: Into<String>,
    {
        self.init_failed.insert(name.into(), failure);
    }

    /// A flag shared with signal handlers; clearing it stops the collector
    /// at the next logical point.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.continue_running)
    }

    /// Tell the collector to stop at the next logical point. In-flight
    /// check executions run to completion; no further check or emission
    /// step begins.
    pub fn stop(&mut self) {
        self.continue_running.store(false, Ordering::SeqCst);
        for check in &mut self.checks {
            check.stop();
        }
        if let Some(ref mut agent_metrics) = self.agent_metrics {
            agent_metrics.stop();
        }
    }

    fn is_first_run(&self) -> bool {
        self.run_count <= 1
    }

    /// Whether `data_name`'s refresh interval has passed. Always true on
    /// the first run.
    fn should_send_additional_data(&mut self, data_name: &'static str) -> bool {
        if self.run_count <= 1 {
            return true;
        }
        let now = time::now_f64();
        if let Some(push) = self.push_times.get_mut(data_name) {
            if now - push.start >= push.interval {
                debug!("{} interval has passed, sending it", data_name);
                push.start = now;
                return true;
            }
        }
        false
    }

    /// Run one full collection cycle and hand the payload to the
    /// emitters. Returns `None` when a stop was requested mid-cycle.
    pub fn run(&mut self) -> Option<CycleStatus> {
        if !self.continue_running.load(Ordering::SeqCst) {
            return None;
        }
        self.run_count += 1;
        debug!("starting collection run #{}", self.run_count);
        let timer = Instant::now();

        let mut payload = AgentPayload::new();
        self.build_payload_skeleton(&mut payload);

        let mut metrics: Vec<Point> = Vec::new();
        let mut events: HashMap<String, Vec<Event>> = HashMap::new();
        let mut service_checks: Vec<ServiceCheck> = Vec::new();

        // Built-in system checks, best-effort. A failure means this data
        // is missing this cycle, nothing more.
        for system_check in &mut self.system_checks {
            match system_check.check() {
                Ok(entries) => {
                    for (key, value) in entries {
                        payload.insert(key, value);
                    }
                }
                Err(e) => error!("unable to get {} metrics: {}", system_check.name(), e),
            }
        }

        let mut check_statuses: Vec<CheckStatus> = Vec::new();
        for check in &mut self.checks {
            if !self.continue_running.load(Ordering::SeqCst) {
                return None;
            }
            if self.run_count <= 1 {
                info!("running check {}", check.name);
            } else {
                debug!("running check {}", check.name);
            }
            let check_start = Instant::now();
            let instance_statuses = check.run();

            let current_metrics = check.get_metrics();
            let current_events = check.get_events();
            let current_metadata = check.get_service_metadata();
            let metric_count = current_metrics.len();
            let event_count = current_events.len();
            metrics.extend(current_metrics);
            if !current_events.is_empty() {
                events
                    .entry(check.name.clone())
                    .or_insert_with(Vec::new)
                    .extend(current_events);
            }

            let mut check_status = CheckStatus {
                name: check.name.clone(),
                source_type_name: check.source_type_name.clone(),
                instance_statuses: Some(instance_statuses),
                metric_count: metric_count,
                event_count: event_count,
                service_check_count: 0,
                service_metadata: current_metadata,
                library_versions: check.library_info(),
                check_version: check.check_version(),
                init_failure: None,
            };

            // Derived per-check status record.
            let derived = match check_status.status() {
                Status::Error => ServiceStatus::Critical,
                _ => ServiceStatus::Ok,
            };
            let service_check_tags = vec![format!("check:{}", check.name)];
            check.service_check(
                "kestrel.agent.check_status",
                derived,
                Some(&service_check_tags),
            );

            let current_service_checks = check.get_service_checks();
            // The operator doesn't care about the derived record in the
            // count.
            check_status.service_check_count = current_service_checks.len().saturating_sub(1);
            service_checks.extend(current_service_checks);

            let check_run_time = time::elapsed_ns(check_start) as f64 / 1e9;
            debug!("check {} ran in {:.2}s", check.name, check_run_time);
            if self.check_timings {
                let mut point =
                    Point::new("kestrel.agent.check_run_time", time::now(), check_run_time);
                point.attributes.tags = TagSet::from_slice(&service_check_tags);
                point.attributes.metric_type = Some("gauge");
                metrics.push(point);
            }
            check_statuses.push(check_status);
        }

        for (check_name, failure) in &self.init_failed {
            if !self.continue_running.load(Ordering::SeqCst) {
                return None;
            }
            check_statuses.push(CheckStatus {
                name: check_name.clone(),
                source_type_name: check_name.clone(),
                instance_statuses: None,
                metric_count: 0,
                event_count: 0,
                service_check_count: 0,
                service_metadata: Vec::new(),
                library_versions: None,
                check_version: failure.version.clone(),
                init_failure: Some(failure.clone()),
            });
        }

        // Agent liveness.
        service_checks
            .push(ServiceCheck::new("kestrel.agent.up", ServiceStatus::Ok)
                .host_name(&self.hostname));

        self.populate_payload_metadata(&mut payload, &check_statuses, &mut events);

        let collect_duration = time::elapsed_ns(timer) as f64 / 1e9;

        // The agent-metrics check runs dead last so it can observe this
        // cycle's collection timing and the previous cycle's emit timing.
        if let Some(ref mut agent_metrics) = self.agent_metrics {
            if let Some(ref handle) = self.timing_handle {
                let mut slot = handle.lock().expect("timing context lock poisoned");
                *slot = Some(TimingContext {
                    collection_time: Some(collect_duration),
                    emit_time: self.emit_duration,
                });
            }
            agent_metrics.run();
            metrics.extend(agent_metrics.get_metrics());
            // Drain metadata so it doesn't accumulate and leak.
            agent_metrics.get_service_metadata();
        }

        payload.insert("metrics", json_or_null(&metrics));
        payload.insert("events", json_or_null(&events));
        payload.insert("service_checks", json_or_null(&service_checks));

        let emitter_statuses =
            payload.emit(&mut self.emitters, &self.continue_running, self.merge_payloads);
        let emit_duration = time::elapsed_ns(timer) as f64 / 1e9 - collect_duration;
        self.emit_duration = Some(emit_duration);

        if self.run_count <= FLUSH_LOGGING_INITIAL || self.run_count % FLUSH_LOGGING_PERIOD == 0 {
            info!(
                "finished run #{}. collection time: {:.2}s, emit time: {:.2}s",
                self.run_count, collect_duration, emit_duration
            );
            if self.run_count == FLUSH_LOGGING_INITIAL {
                info!(
                    "first flushes done, next flushes logged every {} flushes",
                    FLUSH_LOGGING_PERIOD
                );
            }
        } else {
            debug!(
                "finished run #{}. collection time: {:.2}s, emit time: {:.2}s",
                self.run_count, collect_duration, emit_duration
            );
        }

        Some(CycleStatus {
            payload: payload,
            check_statuses: check_statuses,
            emitter_statuses: emitter_statuses,
            collect_duration: collect_duration,
            emit_duration: emit_duration,
        })
    }

    /// The generic entries every payload carries.
    fn build_payload_skeleton(&self, payload: &mut AgentPayload) {
        payload.insert("collection_timestamp", json!(time::now_f64()));
        payload.insert("os", json!(consts::OS));
        payload.insert("agentVersion", json!(self.version));
        payload.insert("internalHostname", json!(self.hostname));
        payload.insert(
            "uuid",
            json!(
                Uuid::new_v5(&Uuid::NAMESPACE_DNS, self.hostname.as_bytes())
                    .to_simple()
                    .to_string()
            ),
        );
        payload.insert("host-tags", json!({}));
        payload.insert("external_host_tags", json!({}));
    }

    /// Periodically refresh the metadata entries: host metadata on the
    /// slowest timer, external host tags and agent-check summaries on
    /// their own. Everything goes out on the first run.
    fn populate_payload_metadata(
        &mut self,
        payload: &mut AgentPayload,
        check_statuses: &[CheckStatus],
        events: &mut HashMap<String, Vec<Event>>,
    ) {
        if self.is_first_run() {
            let mut startup = Event::new("Agent Startup", "Agent Startup", "");
            startup.msg_text = format!("Version {}", self.version);
            startup.host = Some(self.hostname.clone());
            events.insert("System".to_string(), vec![startup]);
        }

        if self.should_send_additional_data("host_metadata") {
            payload.insert(
                "systemStats",
                json!({
                    "machine": consts::ARCH,
                    "platform": consts::OS,
                    "agentVersion": self.version,
                }),
            );
            let meta = self.hostname_metadata();
            self.hostname_metadata_cache = Some(meta.clone());
            payload.insert("meta", meta);
            if !self.host_tags.is_empty() {
                payload.insert("host-tags", json!({ "system": self.host_tags }));
            }
            if self.is_first_run() {
                info!(
                    "hostname metadata: {:?}, tags: {:?}",
                    self.hostname_metadata_cache, self.host_tags
                );
            }
        }

        if self.should_send_additional_data("external_host_tags") {
            let mut external_host_tags: Vec<Value> = Vec::new();
            for check in &self.checks {
                for (host, tags) in check.external_host_tags() {
                    external_host_tags.push(json!([host, { "system": tags }]));
                }
            }
            if !external_host_tags.is_empty() {
                payload.insert("external_host_tags", json!(external_host_tags));
            }
        }

        if self.should_send_additional_data("agent_checks") {
            let mut agent_checks: Vec<Value> = Vec::new();
            for check in check_statuses {
                if let Some(ref instance_statuses) = check.instance_statuses {
                    for (i, instance) in instance_statuses.iter().enumerate() {
                        // Error message or warning list, whichever the
                        // instance carries; the UI sorts it out.
                        let detail: Value = match instance.error {
                            Some(ref error) => json!(error),
                            None if !instance.warnings.is_empty() => json!(instance.warnings),
                            None => json!(""),
                        };
                        agent_checks.push(json!([
                            check.name,
                            check.source_type_name,
                            instance.instance_id,
                            instance.status,
                            detail,
                            check.service_metadata.get(i),
                        ]));
                    }
                } else if let Some(ref failure) = check.init_failure {
                    agent_checks.push(json!([
                        check.name,
                        check.source_type_name,
                        "initialization",
                        Status::Error,
                        failure.error,
                    ]));
                }
            }
            payload.insert("agent_checks", json!(agent_checks));
            if let Some(ref meta) = self.hostname_metadata_cache {
                payload.insert("meta", meta.clone());
            }
        }
    }

    /// Hostname metadata, the slow-moving identity block.
    fn hostname_metadata(&self) -> Value {
        let mut meta = Map::new();
        meta.insert("hostname".to_string(), json!(self.hostname));
        meta.insert("agentVersion".to_string(), json!(self.version));
        meta.insert("host_aliases".to_string(), json!([]));
        if let Ok(socket_hostname) = ::std::env::var("HOSTNAME") {
            meta.insert("socket-hostname".to_string(), json!(socket_hostname));
        }
        Value::Object(meta)
    }
}

fn json_or_null<T>(value: &T) -> Value
where
    T: ::serde::Serialize,
{
    serde_json::to_value(value).unwrap_or(Value::Null)
}

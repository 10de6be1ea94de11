extern crate kestrel;
extern crate serde_json;
extern crate toml;

use kestrel::check::{Check, CheckError, CheckRunner, Instance, Sender};
use kestrel::collector::{AgentMetricsCheck, Collector, AGENT_METRICS_CHECK_NAME};
use kestrel::config::Args;
use kestrel::emitter::Emitter;
use kestrel::metric::ServiceStatus;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Emitter that stores every delivered payload for inspection.
struct Capture {
    payloads: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Capture {
    fn new() -> (Capture, Arc<Mutex<Vec<(String, Value)>>>) {
        let payloads = Arc::new(Mutex::new(Vec::new()));
        (
            Capture {
                payloads: Arc::clone(&payloads),
            },
            payloads,
        )
    }
}

impl Emitter for Capture {
    fn name(&self) -> &str {
        "capture"
    }

    fn deliver(&mut self, payload: &Value, endpoint: &str) -> Result<(), String> {
        self.payloads
            .lock()
            .unwrap()
            .push((endpoint.to_string(), payload.clone()));
        Ok(())
    }
}

/// A web-server check exercising the whole submission surface: a gauge, a
/// monotonic count, a histogram and a service check, tagged from its
/// instance configuration.
struct WebCheck {
    requests_total: f64,
}

impl Check for WebCheck {
    fn check(&mut self, sender: &mut Sender, instance: &Instance) -> Result<(), CheckError> {
        let endpoint = instance
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CheckError::new("instance missing `endpoint`"))?;
        let tags = vec![format!("endpoint:{}", endpoint)];
        sender.gauge("web.active_conns", 17.0, Some(&tags), None, None, None)?;
        self.requests_total += 50.0;
        sender.monotonic_count("web.requests_total", self.requests_total, Some(&tags), None, None)?;
        for latency in &[3.0, 5.0, 8.0] {
            sender.histogram("web.latency", *latency, Some(&tags), None, None)?;
        }
        sender.service_check(
            "web.can_connect",
            ServiceStatus::Ok,
            Some(&tags),
            None,
            None,
            None,
        );
        Ok(())
    }
}

fn web_instance() -> Instance {
    let mut instance = Instance::new();
    instance.insert(
        "endpoint".to_string(),
        toml::Value::String("127.0.0.1:80".to_string()),
    );
    instance
}

fn metric_names(payload: &Value) -> Vec<String> {
    payload["metrics"]
        .as_array()
        .expect("metrics")
        .iter()
        .map(|m| m[0].as_str().expect("metric name").to_string())
        .collect()
}

#[test]
fn two_full_cycles_end_to_end() {
    let args = Args::default();
    let mut collector = Collector::new(&args);
    let (capture, payloads) = Capture::new();
    collector.add_emitter(Box::new(capture));

    let config = args.check_config().instances(vec![web_instance()]);
    collector.add_check(CheckRunner::new(
        "web",
        Box::new(WebCheck { requests_total: 0.0 }),
        config,
    ));

    let agent_metrics = AgentMetricsCheck::new();
    let timing_handle = agent_metrics.context_handle();
    collector.set_agent_metrics(
        CheckRunner::new(
            AGENT_METRICS_CHECK_NAME,
            Box::new(agent_metrics),
            args.check_config(),
        ),
        timing_handle,
    );

    let first = collector.run().expect("first cycle");
    assert_eq!(1, first.check_statuses.len());
    assert_eq!(1, first.emitter_statuses.len());
    let second = collector.run().expect("second cycle");
    assert_eq!(1, second.check_statuses.len());

    let payloads = payloads.lock().unwrap();
    assert_eq!(2, payloads.len());
    let (ref endpoint, ref first_payload) = payloads[0];
    let (_, ref second_payload) = payloads[1];
    assert_eq!("", endpoint);

    // Gauge, histogram statistics and the agent's own timing land in the
    // first cycle. The monotonic count only has a baseline so far.
    let names = metric_names(first_payload);
    assert!(names.contains(&"web.active_conns".to_string()));
    assert!(names.contains(&"web.latency.max".to_string()));
    assert!(names.contains(&"web.latency.95percentile".to_string()));
    assert!(names.contains(&"kestrel.agent.collection_time".to_string()));
    assert!(!names.contains(&"web.requests_total".to_string()));

    // The second cycle sees the counter delta.
    let names = metric_names(second_payload);
    assert!(names.contains(&"web.requests_total".to_string()));
    let requests = second_payload["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m[0] == "web.requests_total")
        .unwrap();
    assert_eq!(50.0, requests[2]);

    // Instance tags survived into the attributes.
    let conns = first_payload["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m[0] == "web.active_conns")
        .unwrap();
    assert_eq!("endpoint:127.0.0.1:80", conns[3]["tags"][0]);
    assert_eq!(args.hostname, conns[3]["hostname"]);

    // The check's own record, the derived status record and liveness.
    let service_checks = first_payload["service_checks"].as_array().unwrap();
    let check_names: Vec<&str> = service_checks
        .iter()
        .map(|sc| sc["check"].as_str().unwrap())
        .collect();
    assert!(check_names.contains(&"web.can_connect"));
    assert!(check_names.contains(&"kestrel.agent.check_status"));
    assert!(check_names.contains(&"kestrel.agent.up"));

    // First cycle carries the startup event and the metadata blocks.
    assert!(first_payload["events"]["System"].is_array());
    assert!(first_payload["meta"].is_object());
    assert!(first_payload["agent_checks"].is_array());
    assert!(second_payload.get("meta").is_none());
}

#[test]
fn split_payload_mode_delivers_to_both_endpoints() {
    let mut args = Args::default();
    args.merge_payloads = false;
    let mut collector = Collector::new(&args);
    let (capture, payloads) = Capture::new();
    collector.add_emitter(Box::new(capture));
    let config = args.check_config().instances(vec![web_instance()]);
    collector.add_check(CheckRunner::new(
        "web",
        Box::new(WebCheck { requests_total: 0.0 }),
        config,
    ));

    collector.run().expect("cycle");
    let payloads = payloads.lock().unwrap();
    assert_eq!(2, payloads.len());
    let (ref data_endpoint, ref data) = payloads[0];
    let (ref meta_endpoint, ref meta) = payloads[1];
    assert_eq!("metrics", data_endpoint);
    assert_eq!("metadata", meta_endpoint);
    assert!(data.get("metrics").is_some());
    assert!(data.get("meta").is_none());
    assert!(meta.get("meta").is_some());
    assert!(meta.get("metrics").is_none());
    // Both identify the reporting agent.
    assert_eq!(data["agentVersion"], meta["agentVersion"]);
    assert_eq!(data["internalHostname"], meta["internalHostname"]);
}

#![allow(unknown_lints)]

extern crate chan_signal;
extern crate chrono;
extern crate fern;
extern crate kestrel;

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_json;

use chan_signal::Signal;
use chrono::Utc;
use kestrel::check::CheckRunner;
use kestrel::collector::{AgentMetricsCheck, Collector, SystemCheck, AGENT_METRICS_CHECK_NAME};
use kestrel::emitter;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::Read;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Load averages from /proc/loadavg. The OS side of the system-check
/// boundary lives with the binary; on hosts without procfs the failure is
/// logged and the cycle carries on without the data.
struct LoadAvg;

impl SystemCheck for LoadAvg {
    fn name(&self) -> &str {
        "load"
    }

    fn check(&mut self) -> Result<Map<String, Value>, String> {
        let mut buffer = String::new();
        File::open("/proc/loadavg")
            .and_then(|mut f| f.read_to_string(&mut buffer))
            .map_err(|e| format!("could not read /proc/loadavg: {}", e))?;
        let mut entries = Map::new();
        let mut fields = buffer.split_whitespace();
        for key in &["loadAvrg1", "loadAvrg5", "loadAvrg15"] {
            match fields.next().and_then(|f| f.parse::<f64>().ok()) {
                Some(value) => {
                    entries.insert(key.to_string(), json!(value));
                }
                None => return Err("unexpected /proc/loadavg format".to_string()),
            }
        }
        Ok(entries)
    }
}

fn main() {
    let args = kestrel::config::parse_args();

    let level = match args.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let signal = chan_signal::notify(&[Signal::INT, Signal::TERM]);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                record.target(),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("could not set up logging");

    info!("kestrel - {}", args.version);

    let mut collector = Collector::new(&args);
    collector.add_emitter(Box::new(emitter::Console));
    collector.add_system_check(Box::new(LoadAvg));

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

    let continue_running = collector.stop_handle();
    let worker_flag = collector.stop_handle();
    let flush_interval = args.flush_interval;

    let worker = thread::spawn(move || {
        loop {
            if collector.run().is_none() {
                break;
            }
            let mut slept = 0;
            while slept < flush_interval && worker_flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                slept += 1;
            }
        }
        collector.stop();
    });

    signal.recv().expect("signal channel hung up");
    info!("shutdown signal received, stopping after the current cycle");
    continue_running.store(false, Ordering::SeqCst);
    worker.join().expect("failed to join collector thread");
}

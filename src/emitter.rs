//! The transmission boundary.
//!
//! The collector assembles a payload and hands it to every configured
//! emitter; what happens on the wire after that is somebody else's problem.
//! An emitter failure is captured as a status record, never propagated into
//! the collection cycle.

use serde_json;
use serde_json::Value;

/// Endpoint hint for a merged payload.
pub const COMMON_ENDPOINT: &'static str = "";
/// Endpoint hint for the data sub-payload.
pub const DATA_ENDPOINT: &'static str = "metrics";
/// Endpoint hint for the metadata sub-payload.
pub const METADATA_ENDPOINT: &'static str = "metadata";

/// A sink for assembled payloads.
pub trait Emitter: Send {
    /// The emitter's name, used in status records.
    fn name(&self) -> &str;

    /// Hand one payload to the transmission layer. `endpoint` is one of
    /// the endpoint hints above, depending on whether payloads are merged
    /// or split.
    fn deliver(&mut self, payload: &Value, endpoint: &str) -> Result<(), String>;
}

/// Emitter that prints a payload summary to stdout, the full payload at
/// trace level.
pub struct Console;

impl Emitter for Console {
    fn name(&self) -> &str {
        "console"
    }

    fn deliver(&mut self, payload: &Value, endpoint: &str) -> Result<(), String> {
        let metrics = payload
            .get("metrics")
            .and_then(|m| m.as_array())
            .map(|m| m.len())
            .unwrap_or(0);
        let service_checks = payload
            .get("service_checks")
            .and_then(|s| s.as_array())
            .map(|s| s.len())
            .unwrap_or(0);
        let endpoint = if endpoint.is_empty() { "common" } else { endpoint };
        println!(
            "Flushing payload to {}: {} metrics, {} service checks",
            endpoint, metrics, service_checks
        );
        match serde_json::to_string_pretty(payload) {
            Ok(rendered) => trace!("payload: {}", rendered),
            Err(e) => return Err(format!("could not render payload: {}", e)),
        }
        Ok(())
    }
}

/// Emitter that discards everything, for benchmarking and tests.
pub struct Null;

impl Emitter for Null {
    fn name(&self) -> &str {
        "null"
    }

    fn deliver(&mut self, _payload: &Value, _endpoint: &str) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn console_delivers_any_json() {
        let mut console = Console;
        let payload = json!({
            "metrics": [["m", 1, 2.0]],
            "service_checks": [],
        });
        assert!(console.deliver(&payload, COMMON_ENDPOINT).is_ok());
        assert!(console.deliver(&payload, DATA_ENDPOINT).is_ok());
    }

    #[test]
    fn null_swallows_everything() {
        let mut null = Null;
        assert!(null.deliver(&json!(null), METADATA_ENDPOINT).is_ok());
    }
}

//! Status records produced by check runs and collection cycles: what ran,
//! what it emitted, what went wrong. These are operator-facing summaries,
//! folded into the payload's periodic `agent_checks` metadata.

use std::collections::HashMap;

/// Outcome of one check instance in one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Status {
    /// The instance ran and raised no warnings.
    Ok,
    /// The instance ran but accumulated warnings.
    Warning,
    /// The instance raised a failure.
    Error,
    /// The instance was throttled by its minimum collection interval and
    /// did not run this cycle.
    Skipped,
}

/// Wall-clock statistics for a profiled instance run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstanceStats {
    /// Seconds spent inside the check's logic.
    pub run_time: f64,
}

/// Per-instance-per-run record. Created once per instance per run and
/// folded into the cycle's `CheckStatus`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstanceStatus {
    /// Index of the instance in the check's configuration.
    pub instance_id: usize,
    /// Outcome of the run.
    pub status: Status,
    /// Warnings accumulated during the run.
    pub warnings: Vec<String>,
    /// Run statistics, present when profiling is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_stats: Option<InstanceStats>,
    /// Failure message, for `Status::Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured failure detail, for `Status::Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl InstanceStatus {
    /// An OK record for instance `instance_id`.
    pub fn ok(instance_id: usize, check_stats: Option<InstanceStats>) -> InstanceStatus {
        InstanceStatus {
            instance_id: instance_id,
            status: Status::Ok,
            warnings: Vec::new(),
            check_stats: check_stats,
            error: None,
            trace: None,
        }
    }

    /// A warning record carrying the run's accumulated warnings.
    pub fn warning(
        instance_id: usize,
        warnings: Vec<String>,
        check_stats: Option<InstanceStats>,
    ) -> InstanceStatus {
        InstanceStatus {
            instance_id: instance_id,
            status: Status::Warning,
            warnings: warnings,
            check_stats: check_stats,
            error: None,
            trace: None,
        }
    }

    /// An error record carrying the failure message and detail.
    pub fn error(instance_id: usize, error: String, trace: Option<String>) -> InstanceStatus {
        InstanceStatus {
            instance_id: instance_id,
            status: Status::Error,
            warnings: Vec::new(),
            check_stats: None,
            error: Some(error),
            trace: trace,
        }
    }

    /// A skipped record for a throttled instance.
    pub fn skipped(instance_id: usize) -> InstanceStatus {
        InstanceStatus {
            instance_id: instance_id,
            status: Status::Skipped,
            warnings: Vec::new(),
            check_stats: None,
            error: None,
            trace: None,
        }
    }
}

/// Why a check never entered the run loop.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InitFailure {
    /// The construction-time failure message.
    pub error: String,
    /// Captured failure detail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// Version of the failing check, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Per-check-per-cycle summary built by the collector.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckStatus {
    /// The check's name.
    pub name: String,
    /// Source type reported upstream; defaults to the check name.
    pub source_type_name: String,
    /// One record per instance that was considered this cycle. `None` when
    /// the check failed to initialize and never ran.
    pub instance_statuses: Option<Vec<InstanceStatus>>,
    /// Points drained from the check this cycle.
    pub metric_count: usize,
    /// Events drained from the check this cycle.
    pub event_count: usize,
    /// Service checks drained this cycle, excluding the agent's own
    /// check-status record.
    pub service_check_count: usize,
    /// Instance metadata rolled up this cycle, one map per instance run.
    pub service_metadata: Vec<HashMap<String, String>>,
    /// Library versions the check reported, if it implements the hook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_versions: Option<HashMap<String, String>>,
    /// Version of the check itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_version: Option<String>,
    /// Initialization failure, for checks that never ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_failure: Option<InitFailure>,
}

impl CheckStatus {
    /// The roll-up status of the whole check for this cycle: `Error` if
    /// initialization failed or any instance errored, else `Warning` if any
    /// instance warned, else `Ok`. Skipped instances do not affect the
    /// roll-up.
    pub fn status(&self) -> Status {
        if self.init_failure.is_some() {
            return Status::Error;
        }
        let mut status = Status::Ok;
        if let Some(ref statuses) = self.instance_statuses {
            for instance in statuses {
                match instance.status {
                    Status::Error => return Status::Error,
                    Status::Warning => status = Status::Warning,
                    Status::Ok | Status::Skipped => {}
                }
            }
        }
        status
    }
}

/// Outcome of handing a payload to one emitter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmitterStatus {
    /// The emitter's name.
    pub name: String,
    /// The delivery failure, if the emitter raised one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmitterStatus {
    /// A successful delivery record.
    pub fn ok<S>(name: S) -> EmitterStatus
    where
        S: Into<String>,
    {
        EmitterStatus {
            name: name.into(),
            error: None,
        }
    }

    /// A failed delivery record.
    pub fn failed<S>(name: S, error: String) -> EmitterStatus
    where
        S: Into<String>,
    {
        EmitterStatus {
            name: name.into(),
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn empty_check_status(instances: Option<Vec<InstanceStatus>>) -> CheckStatus {
        CheckStatus {
            name: "nginx".to_string(),
            source_type_name: "nginx".to_string(),
            instance_statuses: instances,
            metric_count: 0,
            event_count: 0,
            service_check_count: 0,
            service_metadata: Vec::new(),
            library_versions: None,
            check_version: None,
            init_failure: None,
        }
    }

    #[test]
    fn error_dominates_rollup() {
        let cs = empty_check_status(Some(vec![
            InstanceStatus::ok(0, None),
            InstanceStatus::error(1, "boom".to_string(), None),
            InstanceStatus::warning(2, vec!["w".to_string()], None),
        ]));
        assert_eq!(Status::Error, cs.status());
    }

    #[test]
    fn warning_beats_ok() {
        let cs = empty_check_status(Some(vec![
            InstanceStatus::ok(0, None),
            InstanceStatus::warning(1, vec!["w".to_string()], None),
        ]));
        assert_eq!(Status::Warning, cs.status());
    }

    #[test]
    fn skipped_instances_do_not_degrade() {
        let cs = empty_check_status(Some(vec![
            InstanceStatus::ok(0, None),
            InstanceStatus::skipped(1),
        ]));
        assert_eq!(Status::Ok, cs.status());
    }

    #[test]
    fn init_failure_is_an_error() {
        let mut cs = empty_check_status(None);
        cs.init_failure = Some(InitFailure {
            error: "bad config".to_string(),
            trace: None,
            version: None,
        });
        assert_eq!(Status::Error, cs.status());
    }
}

//! The data model shared by the sample stores, the check runtime and the
//! collector: metric kinds, normalized output points, service checks,
//! events and the error taxonomy raised by the aggregation engines.

use regex::Regex;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::fmt;
use time;
use uuid::Uuid;

mod tagset;

pub use self::tagset::TagSet;
pub use self::tagset::cmp;

/// The aggregation semantics bound to a metric name.
///
/// The first submission verb used for a name fixes its kind; later
/// submissions of another kind are rejected rather than silently switching
/// the series' semantics.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, PartialOrd, Eq, Hash)]
pub enum MetricKind {
    /// Point-in-time value, latest submission wins.
    Gauge,
    /// Raw two-sample counter from which a per-second rate is read.
    Counter,
    /// Two-point derivative computed across flush cycles.
    Rate,
    /// Running sum over the open cycle.
    Count,
    /// Cycle delta of an ever-increasing raw counter, reset tolerant.
    MonotonicCount,
    /// All samples of the open cycle, reduced to aggregates on flush.
    Histogram,
    /// Unique values of the open cycle, flushed as a cardinality.
    Set,
}

/// Errors raised by sample submission and extraction.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A sample was saved for a metric that was never declared.
    UndefinedMetric(String),
    /// A submitted value was not a finite number.
    NaN(String),
    /// A rate was computed over a zero time interval.
    Infinity,
    /// Not enough history to compute a value. Treated as "no data yet" and
    /// silently skipped during extraction, never surfaced to operators.
    UnknownValue,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::UndefinedMetric(ref name) => {
                write!(f, "saving a sample for an undefined metric: {}", name)
            }
            Error::NaN(ref name) => write!(f, "non-finite value submitted for {}", name),
            Error::Infinity => write!(f, "rate over a zero time interval"),
            Error::UnknownValue => write!(f, "not enough history to compute a value"),
        }
    }
}

impl ::std::error::Error for Error {
    fn description(&self) -> &str {
        "metric error"
    }
}

/// The attribute map carried by a normalized point. Only non-empty
/// attributes are serialized into the payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Attributes {
    /// Tags of the originating context, sorted and deduplicated.
    #[serde(skip_serializing_if = "TagSet::is_empty")]
    pub tags: TagSet,
    /// Hostname the point was reported for, when not the agent's own.
    #[serde(rename = "hostname", skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    /// Device the point was reported for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// The point's wire type, e.g. "gauge".
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<&'static str>,
}

impl Attributes {
    /// True if no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.host_name.is_none()
            && self.device_name.is_none()
            && self.metric_type.is_none()
    }
}

/// One normalized time-series point, the unit handed to transmission.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// The metric name.
    pub name: String,
    /// Epoch seconds the point is considered to have happened.
    pub timestamp: i64,
    /// The value.
    pub value: f64,
    /// Tags, hostname, device and type, where present.
    pub attributes: Attributes,
}

impl Point {
    /// Make a bare point with empty attributes.
    pub fn new<S>(name: S, timestamp: i64, value: f64) -> Point
    where
        S: Into<String>,
    {
        Point {
            name: name.into(),
            timestamp: timestamp,
            value: value,
            attributes: Attributes::default(),
        }
    }
}

impl Serialize for Point {
    /// Points serialize as `[name, timestamp, value]` tuples, with the
    /// attribute map appended only when any attribute is present.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = if self.attributes.is_empty() { 3 } else { 4 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.name)?;
        seq.serialize_element(&self.timestamp)?;
        seq.serialize_element(&self.value)?;
        if !self.attributes.is_empty() {
            seq.serialize_element(&self.attributes)?;
        }
        seq.end()
    }
}

/// Service check status codes, by wire value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    /// Everything is fine.
    Ok,
    /// Degraded but functioning.
    Warning,
    /// Down or failing.
    Critical,
    /// Status could not be determined.
    Unknown,
}

impl ServiceStatus {
    /// The wire value, 0 through 3.
    pub fn as_u8(self) -> u8 {
        match self {
            ServiceStatus::Ok => 0,
            ServiceStatus::Warning => 1,
            ServiceStatus::Critical => 2,
            ServiceStatus::Unknown => 3,
        }
    }
}

impl Serialize for ServiceStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

/// A structured service check record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceCheck {
    /// Run id, for logging and tracing. Not required to be unique.
    pub id: String,
    /// Name of the service check.
    pub check: String,
    /// Reported status.
    pub status: ServiceStatus,
    /// Epoch seconds the run occurred.
    pub timestamp: f64,
    /// Host that generated the check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    /// Tags for this run, sorted and deduplicated.
    #[serde(skip_serializing_if = "TagSet::is_empty")]
    pub tags: TagSet,
    /// Free-form status message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceCheck {
    /// Create a service check record, stamping a fresh run id and the
    /// current time when none is supplied.
    pub fn new<S>(check: S, status: ServiceStatus) -> ServiceCheck
    where
        S: Into<String>,
    {
        ServiceCheck {
            id: Uuid::new_v4().to_string(),
            check: check.into(),
            status: status,
            timestamp: time::now_f64(),
            host_name: None,
            tags: TagSet::default(),
            message: None,
        }
    }

    /// Set the record's hostname.
    pub fn host_name<S>(mut self, host: S) -> ServiceCheck
    where
        S: Into<String>,
    {
        self.host_name = Some(host.into());
        self
    }

    /// Set the record's tags. Sorting and deduplication happen here.
    pub fn tags(mut self, tags: &[String]) -> ServiceCheck {
        self.tags = TagSet::from_slice(tags);
        self
    }

    /// Set the record's timestamp.
    pub fn timestamp(mut self, ts: f64) -> ServiceCheck {
        self.timestamp = ts;
        self
    }

    /// Set the record's message.
    pub fn message<S>(mut self, message: S) -> ServiceCheck
    where
        S: Into<String>,
    {
        self.message = Some(message.into());
        self
    }
}

/// An event record saved by a check for the newsfeed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    /// Epoch seconds the event happened.
    pub timestamp: i64,
    /// The event type name.
    pub event_type: String,
    /// Title shown in the feed.
    pub msg_title: String,
    /// Body text.
    pub msg_text: String,
    /// One of "error", "warning", "success", "info". Defaults to "info".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_type: Option<String>,
    /// Host the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Tags to associate with the event.
    #[serde(skip_serializing_if = "TagSet::is_empty")]
    pub tags: TagSet,
    /// Source type name, when distinct from the check name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type_name: Option<String>,
    /// Key used to aggregate related events server-side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_key: Option<String>,
}

impl Event {
    /// Make an event with the required fields, timestamped now.
    pub fn new<S>(event_type: S, msg_title: S, msg_text: S) -> Event
    where
        S: Into<String>,
    {
        Event {
            timestamp: time::now(),
            event_type: event_type.into(),
            msg_title: msg_title.into(),
            msg_text: msg_text.into(),
            alert_type: None,
            host: None,
            tags: TagSet::default(),
            source_type_name: None,
            aggregation_key: None,
        }
    }
}

lazy_static! {
    static ref ILLEGAL_CHARS: Regex = Regex::new(r"[,@+*/\-\(\)\[\]\{\}\s]").unwrap();
    static ref MULTI_UNDERSCORE: Regex = Regex::new(r"__+").unwrap();
    static ref LEADING_UNDERSCORE: Regex = Regex::new(r"^_+").unwrap();
    static ref TRAILING_UNDERSCORE: Regex = Regex::new(r"_+$").unwrap();
    static ref DOT_UNDERSCORE: Regex = Regex::new(r"_*\._*").unwrap();
}

/// Turn a raw metric name into a well-formed `prefix.b.c` name.
///
/// Illegal characters become underscores, runs of underscores collapse,
/// and underscores hugging dots or the ends of the name are dropped.
///
/// # Examples
///
/// ```
/// use kestrel::metric::normalize_name;
///
/// assert_eq!("disk.used_pct", normalize_name("disk._used pct_", None));
/// assert_eq!("sys.mem_free", normalize_name("mem (free)", Some("sys")));
/// ```
pub fn normalize_name(metric: &str, prefix: Option<&str>) -> String {
    let name = ILLEGAL_CHARS.replace_all(metric, "_");
    let name = MULTI_UNDERSCORE.replace_all(&name, "_");
    let name = DOT_UNDERSCORE.replace_all(&name, ".");
    let name = LEADING_UNDERSCORE.replace(&name, "");
    let name = TRAILING_UNDERSCORE.replace(&name, "");
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, name),
        None => name.into_owned(),
    }
}

/// Normalize a device name: trimmed, lowercased, spaces to underscores.
pub fn normalize_device_name(device_name: &str) -> String {
    device_name.trim().to_lowercase().replace(' ', "_")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_strips_illegal_runs() {
        assert_eq!("a.b.c", normalize_name("a.b.c", None));
        assert_eq!("a.b_c", normalize_name("a.b c", None));
        assert_eq!("a.b_c", normalize_name("a.b  - c", None));
        assert_eq!("queue.depth", normalize_name("_queue_.depth_", None));
        assert_eq!("pfx.jvm_heap", normalize_name("jvm heap", Some("pfx")));
    }

    #[test]
    fn normalize_device_names() {
        assert_eq!("sda_1", normalize_device_name(" SDA 1 "));
    }

    #[test]
    fn point_serializes_as_tuple() {
        let p = Point::new("foo.bar", 101, 1.5);
        let js = ::serde_json::to_string(&p).unwrap();
        assert_eq!("[\"foo.bar\",101,1.5]", js);
    }

    #[test]
    fn point_with_attributes_serializes_map() {
        let mut p = Point::new("foo.bar", 101, 2.0);
        p.attributes.tags.insert("role:web");
        p.attributes.metric_type = Some("gauge");
        let js = ::serde_json::to_value(&p).unwrap();
        assert_eq!(4, js.as_array().unwrap().len());
        assert_eq!("gauge", js[3]["type"]);
        assert_eq!("role:web", js[3]["tags"][0]);
    }

    #[test]
    fn service_status_wire_values() {
        assert_eq!(0, ServiceStatus::Ok.as_u8());
        assert_eq!(1, ServiceStatus::Warning.as_u8());
        assert_eq!(2, ServiceStatus::Critical.as_u8());
        assert_eq!(3, ServiceStatus::Unknown.as_u8());
    }

    #[test]
    fn service_check_tags_sorted() {
        let sc = ServiceCheck::new("kestrel.agent.check_status", ServiceStatus::Ok)
            .tags(&["b".to_string(), "a".to_string(), "b".to_string()]);
        let flat: Vec<&str> = sc.tags.iter().map(|t| t.as_str()).collect();
        assert_eq!(vec!["a", "b"], flat);
    }
}

//! Provides the agent's configuration: the TOML file the binary consumes
//! and the CLI option parser layered on top of it.
//!
//! Everything here has a sensible default, so an empty file -- or no file
//! at all -- yields a working agent.

use aggregator::HistAggregate;
use check::CheckConfig;
use clap::{App, Arg};
use std::fmt;
use std::fs::File;
use std::io;
use std::io::Read;
use std::process;
use toml;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

fn default_version() -> String {
    VERSION.unwrap_or("unknown").to_string()
}

fn default_hostname() -> String {
    ::std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_flush_interval() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_histogram_aggregates() -> Vec<String> {
    vec![
        "max".to_string(),
        "median".to_string(),
        "avg".to_string(),
        "count".to_string(),
    ]
}

fn default_histogram_percentiles() -> Vec<f64> {
    vec![0.95]
}

fn default_metadata_interval() -> u64 {
    4 * 60 * 60
}

fn default_external_host_tags_interval() -> u64 {
    5 * 60
}

fn default_agent_checks_interval() -> u64 {
    10 * 60
}

/// Big configuration struct for the kestrel executable.
///
/// This struct is what we construct from parsing the kestrel configuration
/// file. It is not intended to be created by external clients. Please see
/// documentation on `parse_args` in this module for more details.
#[derive(Clone, Debug, Deserialize)]
pub struct Args {
    /// The hostname the agent reports for itself.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Agent version string. This is set automatically.
    #[serde(default = "default_version")]
    pub version: String,
    /// Seconds between collection cycles.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    /// The verbosity setting of kestrel. The higher the value the more
    /// chatty kestrel gets.
    #[serde(default)]
    pub verbose: u64,
    /// Static host tags from the configuration file.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Seconds an instance must wait between runs, overridable per check
    /// and per instance.
    #[serde(default)]
    pub min_collection_interval: f64,
    /// Histogram statistics emitted at flush; a subset of min, max,
    /// median, avg, sum, count.
    #[serde(default = "default_histogram_aggregates")]
    pub histogram_aggregates: Vec<String>,
    /// Histogram percentiles emitted at flush, each in (0, 1).
    #[serde(default = "default_histogram_percentiles")]
    pub histogram_percentiles: Vec<f64>,
    /// Time instance runs and attach run statistics to statuses.
    #[serde(default)]
    pub developer_mode: bool,
    /// Emit a per-check run-time point each cycle.
    #[serde(default)]
    pub check_timings: bool,
    /// Merge the data and metadata payloads into one delivery instead of
    /// splitting them across endpoints.
    #[serde(default = "default_true")]
    pub merge_payloads: bool,
    /// Seconds between host metadata refreshes.
    #[serde(default = "default_metadata_interval")]
    pub metadata_interval: u64,
    /// Seconds between external host tag refreshes.
    #[serde(default = "default_external_host_tags_interval")]
    pub external_host_tags_interval: u64,
    /// Seconds between agent-check summary refreshes.
    #[serde(default = "default_agent_checks_interval")]
    pub agent_checks_interval: u64,
}

impl Default for Args {
    fn default() -> Args {
        Args {
            hostname: default_hostname(),
            version: default_version(),
            flush_interval: default_flush_interval(),
            verbose: 0,
            tags: Vec::new(),
            min_collection_interval: 0.0,
            histogram_aggregates: default_histogram_aggregates(),
            histogram_percentiles: default_histogram_percentiles(),
            developer_mode: false,
            check_timings: false,
            merge_payloads: true,
            metadata_interval: default_metadata_interval(),
            external_host_tags_interval: default_external_host_tags_interval(),
            agent_checks_interval: default_agent_checks_interval(),
        }
    }
}

impl Args {
    /// The configured histogram aggregates, parsed. Unknown names are
    /// dropped with a warning.
    pub fn aggregates(&self) -> Vec<HistAggregate> {
        let mut parsed = Vec::new();
        for name in &self.histogram_aggregates {
            match HistAggregate::from_name(name) {
                Some(aggregate) => parsed.push(aggregate),
                None => warn!("unknown histogram aggregate {}, dropping", name),
            }
        }
        parsed
    }

    /// A `CheckConfig` seeded from this configuration, ready for instances
    /// to be attached.
    pub fn check_config(&self) -> CheckConfig {
        let mut config = CheckConfig::new(&self.hostname);
        config.min_collection_interval = self.min_collection_interval;
        config.histogram_aggregates = self.aggregates();
        config.histogram_percentiles = self.histogram_percentiles.clone();
        config.developer_mode = self.developer_mode;
        config
    }
}

/// What can go wrong reading a configuration file.
#[derive(Debug)]
pub enum Error {
    /// The file could not be read.
    Io(io::Error),
    /// The file was not valid TOML for this configuration.
    Parse(toml::de::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "could not read configuration: {}", e),
            Error::Parse(ref e) => write!(f, "could not parse configuration: {}", e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Error {
        Error::Parse(e)
    }
}

/// Parse a configuration file into `Args`.
pub fn parse_config(path: &str) -> Result<Args, Error> {
    let mut file = File::open(path)?;
    let mut buffer = String::new();
    file.read_to_string(&mut buffer)?;
    let mut args: Args = toml::from_str(&buffer)?;
    // The running binary knows its version better than any config file.
    args.version = default_version();
    Ok(args)
}

/// Parse the command line, loading the configuration file when one is
/// given. Exits the process on an unreadable or unparsable file; there is
/// nothing sensible to do with a broken configuration before the first
/// cycle.
pub fn parse_args() -> Args {
    let matches = App::new("kestrel")
        .version(VERSION.unwrap_or("unknown"))
        .about("A host telemetry agent core")
        .arg(
            Arg::with_name("config-path")
                .long("config")
                .short("C")
                .value_name("config")
                .help("The config file to feed in.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .get_matches();

    let verbosity = matches.occurrences_of("verbose");
    let mut args = match matches.value_of("config-path") {
        Some(path) => match parse_config(path) {
            Ok(args) => args,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        },
        None => Args::default(),
    };
    if verbosity > args.verbose {
        args.verbose = verbosity;
    }
    args
}

#[cfg(test)]
mod test {
    extern crate tempdir;

    use self::tempdir::TempDir;
    use super::*;
    use aggregator::HistAggregate;
    use std::fs::File;
    use std::io::Write;

    fn write_config(contents: &str) -> (TempDir, String) {
        let dir = TempDir::new("kestrel-config").expect("tempdir");
        let path = dir.path().join("kestrel.toml");
        let mut file = File::create(&path).expect("create config");
        file.write_all(contents.as_bytes()).expect("write config");
        (dir, path.to_str().expect("utf8 path").to_string())
    }

    #[test]
    fn empty_config_yields_defaults() {
        let (_dir, path) = write_config("");
        let args = parse_config(&path).expect("parse");
        assert_eq!(15, args.flush_interval);
        assert_eq!(0.0, args.min_collection_interval);
        assert!(args.merge_payloads);
        assert_eq!(vec![0.95], args.histogram_percentiles);
        assert_eq!(
            vec![
                HistAggregate::Max,
                HistAggregate::Median,
                HistAggregate::Avg,
                HistAggregate::Count,
            ],
            args.aggregates()
        );
    }

    #[test]
    fn config_file_overrides_defaults() {
        let (_dir, path) = write_config(
            r#"
hostname = "db01.example.com"
flush_interval = 30
tags = ["env:prod", "role:db"]
min_collection_interval = 20
histogram_aggregates = ["min", "max", "bogus"]
histogram_percentiles = [0.5, 0.99]
check_timings = true
merge_payloads = false
"#,
        );
        let args = parse_config(&path).expect("parse");
        assert_eq!("db01.example.com", args.hostname);
        assert_eq!(30, args.flush_interval);
        assert_eq!(vec!["env:prod".to_string(), "role:db".to_string()], args.tags);
        assert_eq!(20.0, args.min_collection_interval);
        // The unknown aggregate is dropped, the valid ones survive.
        assert_eq!(
            vec![HistAggregate::Min, HistAggregate::Max],
            args.aggregates()
        );
        assert_eq!(vec![0.5, 0.99], args.histogram_percentiles);
        assert!(args.check_timings);
        assert!(!args.merge_payloads);
    }

    #[test]
    fn unparsable_config_is_an_error() {
        let (_dir, path) = write_config("flush_interval = \"soon\"");
        assert!(parse_config(&path).is_err());
    }

    #[test]
    fn missing_config_is_an_error() {
        assert!(parse_config("/nonexistent/kestrel.toml").is_err());
    }

    #[test]
    fn check_config_carries_the_histogram_setup() {
        let (_dir, path) = write_config(
            r#"
histogram_aggregates = ["sum", "count"]
histogram_percentiles = [0.9]
min_collection_interval = 5
"#,
        );
        let args = parse_config(&path).expect("parse");
        let check_config = args.check_config();
        assert_eq!(5.0, check_config.min_collection_interval);
        assert_eq!(
            vec![HistAggregate::Sum, HistAggregate::Count],
            check_config.histogram_aggregates
        );
        assert_eq!(vec![0.9], check_config.histogram_percentiles);
    }
}

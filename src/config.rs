use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::merge::boundary::BoundaryConfig;
use crate::transport::{ChannelAddress, SocketMode};

/// Top-level configuration for the receiver.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Diagnostic verbosity. 0 disables per-request and per-object output.
    #[serde(default = "default_verbose")]
    pub verbose: u32,

    /// Prefix of every output file name. Default: "EMC".
    #[serde(default = "default_subsystem")]
    pub subsystem: String,

    /// Write out accumulated groups when shutting down. Default: true.
    #[serde(default = "default_true")]
    pub flush_on_shutdown: bool,

    /// Upstream channel and polling configuration.
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Aggregation and boundary inference tuning.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Snapshot output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Upstream channel and polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// Inbound channel address. Default: "REQ>tcp://localhost:60201".
    #[serde(rename = "in", default = "default_in")]
    pub input: String,

    /// Optional control channel address, e.g. "PULL>@tcp://*:60299".
    #[serde(default)]
    pub control: String,

    /// Server-side object filter sent with each request.
    #[serde(default)]
    pub select: String,

    /// Ask the merger to reset after each reply.
    #[serde(default)]
    pub reset_merger: bool,

    /// Ask for the schema map with the first request. Default: true.
    #[serde(default = "default_true")]
    pub request_streamers: bool,

    /// Pause between poll cycles. Default: 60s.
    #[serde(default = "default_sleep", with = "humantime_serde")]
    pub sleep: Duration,

    /// Reply timeout. `null` or zero waits forever. Default: 10s.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// Aggregation and boundary inference tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    /// Only objects whose name contains this substring are kept.
    #[serde(default)]
    pub hist_identifier: String,

    /// Pending backlog per name that forces an early merge. Default: 10.
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,

    /// Minimum gap that counts as round evidence. Default: 1s.
    #[serde(default = "default_min_wait", with = "humantime_serde")]
    pub min_wait: Duration,

    /// Confirmations after which a boundary is locked regardless. Default: 5.
    #[serde(default = "default_confirmation_limit")]
    pub confirmation_limit: u32,

    /// Rounds on a locked boundary before a flush. Default: 12.
    #[serde(default = "default_round_limit")]
    pub round_limit: u32,
}

/// Snapshot output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving snapshot files. Default: "data".
    #[serde(default = "default_dir_prefix")]
    pub dir_prefix: PathBuf,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address, e.g. ":9090". Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_verbose() -> u32 {
    1
}

fn default_subsystem() -> String {
    "EMC".to_string()
}

fn default_true() -> bool {
    true
}

fn default_in() -> String {
    "REQ>tcp://localhost:60201".to_string()
}

fn default_sleep() -> Duration {
    Duration::from_secs(60)
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

fn default_max_objects() -> usize {
    10
}

fn default_min_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_confirmation_limit() -> u32 {
    5
}

fn default_round_limit() -> u32 {
    12
}

fn default_dir_prefix() -> PathBuf {
    PathBuf::from("data")
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: default_verbose(),
            subsystem: default_subsystem(),
            flush_on_shutdown: true,
            receiver: ReceiverConfig::default(),
            merge: MergeConfig::default(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            input: default_in(),
            control: String::new(),
            select: String::new(),
            reset_merger: false,
            request_streamers: true,
            sleep: default_sleep(),
            timeout: default_timeout(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            hist_identifier: String::new(),
            max_objects: default_max_objects(),
            min_wait: default_min_wait(),
            confirmation_limit: default_confirmation_limit(),
            round_limit: default_round_limit(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir_prefix: default_dir_prefix(),
        }
    }
}

// --- Loading, overrides and validation ---

impl Config {
    /// Load configuration from a YAML file. Validation is left to the
    /// caller so that command-line overrides can be applied first.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Applies `key=value` command-line options in order.
    pub fn apply_options<S: AsRef<str>>(&mut self, options: &[S]) -> Result<()> {
        for option in options {
            let option = option.as_ref();
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (option, None),
            };
            self.apply_option(key, value)
                .with_context(|| format!("option {option:?}"))?;
        }
        Ok(())
    }

    /// Applies a single option. `value` is `None` for a bare key.
    pub fn apply_option(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        if let ("resetMerger" | "requestStreamers" | "schema", None) = (key, value) {
            return self.apply_option(key, Some("true"));
        }
        let Some(value) = value else {
            bail!("missing value for {key}");
        };

        match key {
            "in" | "ZMQconfigIN" => self.receiver.input = value.to_string(),
            "control" | "ZMQconfigINTERNAL" => self.receiver.control = value.to_string(),
            "verbose" => {
                self.verbose = value
                    .parse()
                    .with_context(|| format!("verbose must be a non-negative integer, got {value:?}"))?;
            }
            "select" => self.receiver.select = value.to_string(),
            "resetMerger" => self.receiver.reset_merger = parse_bool(value)?,
            "requestStreamers" | "schema" => self.receiver.request_streamers = parse_bool(value)?,
            "sleep" | "PollInterval" => self.receiver.sleep = parse_seconds(value)?,
            "timeout" | "PollTimeout" => self.receiver.timeout = parse_timeout(value)?,
            "histIdentifier" => self.merge.hist_identifier = value.to_string(),
            "MaxObjects" => {
                self.merge.max_objects = value
                    .parse()
                    .with_context(|| format!("MaxObjects must be an integer, got {value:?}"))?;
            }
            "dirPrefix" => self.output.dir_prefix = PathBuf::from(value),
            "subsystem" => self.subsystem = value.to_string(),
            _ => bail!("unknown option {key:?}"),
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let input = self.input_address()?;
        if !matches!(input.mode, SocketMode::Req | SocketMode::Sub) {
            bail!("receiver.in must be a REQ or SUB address, got {input}");
        }

        if let Some(control) = self.control_address()? {
            if !matches!(control.mode, SocketMode::Pull | SocketMode::Sub) {
                bail!("receiver.control must be a PULL or SUB address, got {control}");
            }
        }

        if self.merge.max_objects == 0 {
            bail!("merge.max_objects must be at least 1");
        }

        if self.merge.round_limit == 0 {
            bail!("merge.round_limit must be at least 1");
        }

        if self.merge.min_wait.is_zero() {
            bail!("merge.min_wait must be positive");
        }

        if self.subsystem.is_empty() {
            bail!("subsystem is required");
        }

        if self.output.dir_prefix.as_os_str().is_empty() {
            bail!("output.dir_prefix is required");
        }

        Ok(())
    }

    pub fn input_address(&self) -> Result<ChannelAddress> {
        self.receiver
            .input
            .parse::<ChannelAddress>()
            .context("parsing receiver.in")
    }

    /// Control channel address, `None` when not configured.
    pub fn control_address(&self) -> Result<Option<ChannelAddress>> {
        if self.receiver.control.trim().is_empty() {
            return Ok(None);
        }
        self.receiver
            .control
            .parse::<ChannelAddress>()
            .map(Some)
            .context("parsing receiver.control")
    }

    /// Effective reply timeout. Zero means no timeout.
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.receiver.timeout.filter(|t| !t.is_zero())
    }

    /// Default log filter for this verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

impl MergeConfig {
    pub fn boundary(&self) -> BoundaryConfig {
        BoundaryConfig {
            min_wait: self.min_wait,
            confirmation_limit: self.confirmation_limit,
            round_limit: self.round_limit,
        }
    }

    /// Whether `name` passes the identifier filter.
    pub fn accepts(&self, name: &str) -> bool {
        self.hist_identifier.is_empty() || name.contains(&self.hist_identifier)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("expected a boolean, got {value:?}"),
    }
}

fn parse_seconds(value: &str) -> Result<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("expected seconds, got {value:?}"))?;
    if !secs.is_finite() || secs < 0.0 {
        bail!("expected a non-negative number of seconds, got {value:?}");
    }
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("{value:?} seconds is out of range"))
}

/// `inf`, `-1` and anything `<= 0` mean no timeout.
fn parse_timeout(value: &str) -> Result<Option<Duration>> {
    let trimmed = value.trim();
    if matches!(trimmed.to_ascii_lowercase().as_str(), "inf" | "infinite" | "none") {
        return Ok(None);
    }
    let secs: f64 = trimmed
        .parse()
        .with_context(|| format!("expected seconds, got {value:?}"))?;
    if secs.is_nan() {
        bail!("expected seconds, got {value:?}");
    }
    if secs <= 0.0 || secs.is_infinite() {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .with_context(|| format!("{value:?} seconds is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.verbose, 1);
        assert_eq!(cfg.subsystem, "EMC");
        assert_eq!(cfg.receiver.input, "REQ>tcp://localhost:60201");
        assert_eq!(cfg.receiver.sleep, Duration::from_secs(60));
        assert_eq!(cfg.reply_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(cfg.merge.max_objects, 10);
        assert_eq!(cfg.merge.boundary(), BoundaryConfig::default());
        assert_eq!(cfg.output.dir_prefix, PathBuf::from("data"));
        assert!(cfg.health.addr.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
verbose: 2
subsystem: TPC
receiver:
  in: "SUB>tcp://merger:5555"
  control: "PULL>@tcp://*:60299"
  select: "hTPC"
  sleep: 5s
  timeout: null
merge:
  hist_identifier: "Cluster"
  round_limit: 4
  min_wait: 500ms
output:
  dir_prefix: /tmp/out
health:
  addr: ":9090"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");

        assert_eq!(cfg.verbose, 2);
        assert_eq!(cfg.receiver.input, "SUB>tcp://merger:5555");
        assert_eq!(cfg.receiver.sleep, Duration::from_secs(5));
        assert_eq!(cfg.reply_timeout(), None);
        assert!(cfg.receiver.request_streamers);
        assert_eq!(cfg.merge.round_limit, 4);
        assert_eq!(cfg.merge.min_wait, Duration::from_millis(500));
        assert_eq!(cfg.merge.confirmation_limit, 5);
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.control_address().expect("control").map(|a| a.mode),
            Some(SocketMode::Pull)
        );
    }

    #[test]
    fn test_options_with_aliases() {
        let mut cfg = Config::default();
        cfg.apply_options(&[
            "ZMQconfigIN=SUB>tcp://host:1",
            "PollInterval=0.5",
            "PollTimeout=-1",
            "MaxObjects=3",
            "histIdentifier=hEnergy",
            "dirPrefix=/tmp/x",
            "subsystem=PHS",
            "select=PHS",
            "verbose=0",
        ])
        .expect("valid options");

        assert_eq!(cfg.receiver.input, "SUB>tcp://host:1");
        assert_eq!(cfg.receiver.sleep, Duration::from_millis(500));
        assert_eq!(cfg.reply_timeout(), None);
        assert_eq!(cfg.merge.max_objects, 3);
        assert_eq!(cfg.merge.hist_identifier, "hEnergy");
        assert_eq!(cfg.output.dir_prefix, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.subsystem, "PHS");
        assert_eq!(cfg.receiver.select, "PHS");
        assert_eq!(cfg.log_filter(), "warn");
    }

    #[test]
    fn test_bool_options() {
        let mut cfg = Config::default();
        cfg.apply_options(&["resetMerger", "schema=no"]).expect("bools");
        assert!(cfg.receiver.reset_merger);
        assert!(!cfg.receiver.request_streamers);

        cfg.apply_options(&["resetMerger=0", "requestStreamers=yes"])
            .expect("bools");
        assert!(!cfg.receiver.reset_merger);
        assert!(cfg.receiver.request_streamers);

        assert!(cfg.apply_options(&["resetMerger=maybe"]).is_err());
    }

    #[test]
    fn test_timeout_values() {
        assert_eq!(parse_timeout("10").expect("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_timeout("0").expect("0"), None);
        assert_eq!(parse_timeout("-1").expect("-1"), None);
        assert_eq!(parse_timeout("inf").expect("inf"), None);
        assert!(parse_timeout("soon").is_err());
    }

    #[test]
    fn test_oversized_durations_are_errors() {
        let mut cfg = Config::default();
        let err = cfg.apply_options(&["sleep=1e30"]).unwrap_err();
        assert!(format!("{err:#}").contains("out of range"), "{err:#}");
        assert_eq!(cfg.receiver.sleep, Duration::from_secs(60));

        let err = cfg.apply_options(&["timeout=1e30"]).unwrap_err();
        assert!(format!("{err:#}").contains("out of range"), "{err:#}");
        assert_eq!(cfg.reply_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_unknown_option_is_error() {
        let mut cfg = Config::default();
        let err = cfg.apply_options(&["bogus=1"]).unwrap_err();
        assert!(format!("{err:#}").contains("unknown option"));

        let err = cfg.apply_options(&["sleep"]).unwrap_err();
        assert!(format!("{err:#}").contains("missing value"));
    }

    #[test]
    fn test_validation_rejects_bad_modes() {
        let mut cfg = Config::default();
        cfg.receiver.input = "PULL>tcp://localhost:1".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("receiver.in"));

        let mut cfg = Config::default();
        cfg.receiver.control = "REQ>tcp://localhost:1".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("receiver.control"));

        let mut cfg = Config::default();
        cfg.receiver.input = "garbage".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_limits() {
        let mut cfg = Config::default();
        cfg.merge.max_objects = 0;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_objects"));

        let mut cfg = Config::default();
        cfg.merge.round_limit = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.subsystem.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_identifier_filter() {
        let mut merge = MergeConfig::default();
        assert!(merge.accepts("anything"));

        merge.hist_identifier = "EMC".to_string();
        assert!(merge.accepts("hEMCEnergy"));
        assert!(!merge.accepts("hPHOSEnergy"));
    }
}

//! Daemon settings.
//!
//! The teacher's `config.rs` parses one *policy* entry per line
//! (`host quota`). quotad's policy state comes from the package list and
//! the control server instead, so this module is narrower by
//! design: it only holds daemon-local settings (paths, polling intervals,
//! the control endpoint), each with a `Default` matching the device
//! defaults for the device. The file format and the `read_file` /
//! `ParseConfigError` shape are kept from the teacher.

use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{self, BufRead};
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ParseConfigError {
    FileError(io::Error),
    EntryError(String, u32),
}

impl std::error::Error for ParseConfigError {}

impl Display for ParseConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use ParseConfigError::*;

        match self {
            FileError(e) => write!(f, "could not read config file: {}", e),
            EntryError(e, i) => write!(f, "error parsing line {}: {}", i, e),
        }
    }
}

impl From<io::Error> for ParseConfigError {
    fn from(e: io::Error) -> Self {
        ParseConfigError::FileError(e)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub packages_list_path: String,
    pub counter_dir: String,
    pub register_path: String,
    pub configdata_path: String,
    pub control_endpoint: String,
    pub iptables_path: String,
    pub ip6tables_path: String,

    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub sampler_period: Duration,
    pub control_retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            packages_list_path: "/data/system/packages.list".to_owned(),
            counter_dir: "/proc/net/xt_quota".to_owned(),
            register_path: "/data/system/qtareg".to_owned(),
            configdata_path: "/data/data/com.datawind.info/files/configdata".to_owned(),
            control_endpoint: "https://support.datawind-s.com/datausage/dataconfig.jsp"
                .to_owned(),
            iptables_path: "/system/bin/iptables".to_owned(),
            ip6tables_path: "/system/bin/ip6tables".to_owned(),

            poll_attempts: 120,
            poll_interval: Duration::from_secs(5),
            sampler_period: Duration::from_secs(120),
            control_retry_interval: Duration::from_secs(50),
        }
    }
}

impl Config {
    /// Load daemon settings from a `key = value` file, falling back to
    /// `Default::default()` for anything unset. A missing file is not an
    /// error: the daemon is expected to run off defaults on a stock image.
    pub fn new_from_file(filepath: &str) -> Result<Config, ParseConfigError> {
        let mut conf = Config::default();

        let lines = match Self::read_file(Path::new(filepath)) {
            Ok(lines) => lines,
            Err(_) => return Ok(conf),
        };

        for (i, line) in lines.enumerate() {
            let line = line?;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (key, value) = match trimmed.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => {
                    return Err(ParseConfigError::EntryError(
                        format!("expected 'key = value', got '{}'", trimmed),
                        i as u32,
                    ))
                }
            };

            conf.apply(key, value)
                .map_err(|e| ParseConfigError::EntryError(e, i as u32))?;
        }

        Ok(conf)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "packages_list_path" => self.packages_list_path = value.to_owned(),
            "counter_dir" => self.counter_dir = value.to_owned(),
            "register_path" => self.register_path = value.to_owned(),
            "configdata_path" => self.configdata_path = value.to_owned(),
            "control_endpoint" => self.control_endpoint = value.to_owned(),
            "iptables_path" => self.iptables_path = value.to_owned(),
            "ip6tables_path" => self.ip6tables_path = value.to_owned(),
            "poll_attempts" => {
                self.poll_attempts = value
                    .parse()
                    .map_err(|_| format!("'{}' is not a valid attempt count", value))?
            }
            "poll_interval_secs" => self.poll_interval = Duration::from_secs(parse_secs(value)?),
            "sampler_period_secs" => {
                self.sampler_period = Duration::from_secs(parse_secs(value)?)
            }
            "control_retry_interval_secs" => {
                self.control_retry_interval = Duration::from_secs(parse_secs(value)?)
            }
            other => return Err(format!("unknown setting '{}'", other)),
        }

        Ok(())
    }

    pub fn read_file<P>(filepath: P) -> io::Result<io::Lines<io::BufReader<File>>>
    where
        P: AsRef<Path>,
    {
        let file = File::open(filepath)?;
        Ok(io::BufReader::new(file).lines())
    }
}

fn parse_secs(value: &str) -> Result<u64, String> {
    value
        .parse()
        .map_err(|_| format!("'{}' is not a valid number of seconds", value))
}

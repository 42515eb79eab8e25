// Copyright 2020 Joyent, Inc.

//! Tunables shared by the client and server halves of the crate.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use slog::Level;

use crate::error::Error;

/// Promise deadline, also applied to each dial attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
/// Pause between failed dial attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Server workers per hardware thread.
pub const DEFAULT_IO_BOUND: usize = 8;
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Default pool size of a client-side service: one connection per hardware
/// thread.
pub fn default_client_service_max_conns() -> usize {
    hardware_threads()
}

pub fn hardware_threads() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    Off,
    Panic,
    Fatal,
    Error,
    Warn,
    Success,
    Message,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Panic => "PANIC",
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Success => "SUCCESS",
            LogLevel::Message => "MESSAGE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// The slog level records must reach to be emitted, or `None` when
    /// logging is switched off.
    pub fn slog_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Panic | LogLevel::Fatal => Some(Level::Critical),
            LogLevel::Error => Some(Level::Error),
            LogLevel::Warn => Some(Level::Warning),
            LogLevel::Success | LogLevel::Message | LogLevel::Info => {
                Some(Level::Info)
            }
            LogLevel::Debug => Some(Level::Debug),
            LogLevel::Trace => Some(Level::Trace),
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(LogLevel::Off),
            "PANIC" => Ok(LogLevel::Panic),
            "FATAL" => Ok(LogLevel::Fatal),
            "ERROR" => Ok(LogLevel::Error),
            "WARN" => Ok(LogLevel::Warn),
            "SUCCESS" => Ok(LogLevel::Success),
            "MESSAGE" => Ok(LogLevel::Message),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            "TRACE" => Ok(LogLevel::Trace),
            other => Err(Error::Config(format!("unknown log level {:?}", other))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> String {
        level.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(with = "millis")]
    pub timeout: Duration,
    #[serde(with = "millis")]
    pub retry_interval: Duration,
    pub service_max_conns: usize,
    pub io_bound: usize,
    /// `None` leaves each connection's outbound queue unbounded.
    pub outbound_bound: Option<usize>,
    /// `None` leaves each service's inbound response queue unbounded.
    pub inbound_bound: Option<usize>,
    pub max_frame_length: usize,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: DEFAULT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            service_max_conns: default_client_service_max_conns(),
            io_bound: DEFAULT_IO_BOUND,
            outbound_bound: None,
            inbound_bound: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Parses a JSON object, filling in defaults for missing keys, and
    /// validates the result.
    pub fn from_json(s: &str) -> Result<Config, Error> {
        let value: serde_json::Value =
            serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::Config(
                "configuration must be a JSON object".into(),
            ));
        }
        let config: Config = serde_json::from_value(value)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout == Duration::from_secs(0) {
            return Err(Error::Config("timeout must be non-zero".into()));
        }
        if self.service_max_conns == 0 {
            return Err(Error::Config(
                "service_max_conns must be non-zero".into(),
            ));
        }
        if self.io_bound == 0 {
            return Err(Error::Config("io_bound must be non-zero".into()));
        }
        if self.outbound_bound == Some(0) || self.inbound_bound == Some(0) {
            return Err(Error::Config("channel bounds must be non-zero".into()));
        }
        if self.max_frame_length == 0 {
            return Err(Error::Config(
                "max_frame_length must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Size of the server's connection worker pool.
    pub fn server_workers(&self) -> usize {
        hardware_threads() * self.io_bound
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Duration,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!(" Success ".parse::<LogLevel>().unwrap(), LogLevel::Success);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Off.slog_level(), None);
        assert_eq!(LogLevel::Fatal.slog_level(), Some(Level::Critical));
        assert_eq!(LogLevel::Message.slog_level(), Some(Level::Info));
    }

    #[test]
    fn json_fills_in_defaults() {
        let config = Config::from_json(
            r#"{"timeout": 1000, "outbound_bound": 64, "log_level": "debug"}"#,
        )
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.retry_interval, DEFAULT_RETRY_INTERVAL);
        assert_eq!(config.outbound_bound, Some(64));
        assert_eq!(config.inbound_bound, None);
        assert_eq!(config.io_bound, DEFAULT_IO_BOUND);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.service_max_conns, hardware_threads());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_json(r#"{"io_bound": 0}"#).is_err());
        assert!(Config::from_json(r#"{"inbound_bound": 0}"#).is_err());
        assert!(Config::from_json(r#"{"log_level": "LOUD"}"#).is_err());
        assert!(matches!(Config::from_json("[]"), Err(Error::Config(_))));
        assert!(matches!(Config::from_json("15"), Err(Error::Config(_))));
        assert!(Config::from_json("{}").is_ok());
    }

    #[test]
    fn log_levels_convert_from_strings() {
        assert_eq!(
            LogLevel::try_from(String::from("warn")).unwrap(),
            LogLevel::Warn
        );
        assert!(matches!(
            LogLevel::try_from(String::from("chatty")),
            Err(Error::Config(_))
        ));
        assert_eq!(String::from(LogLevel::Trace), "TRACE");
    }

    #[test]
    fn server_workers_scale_with_io_bound() {
        let config = Config {
            io_bound: 2,
            ..Config::default()
        };
        assert_eq!(config.server_workers(), hardware_threads() * 2);
    }
}

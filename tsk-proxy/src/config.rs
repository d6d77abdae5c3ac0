//! Proxy configuration: a flat YAML document loaded once at startup with
//! `serde_yaml`, the way the teacher's `authenticator` service loads its config with
//! `serde_json::from_reader` — except this is the one place the crate reaches for
//! YAML rather than JSON, since §6.2 specifies the on-disk format as YAML.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use tskfanout::error::TimeseriesError;
use tskfanout::logging::LogLevel;

const MAX_FILTER_PREFIXES: usize = 1024;

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(rename = "log-level")]
    log_level: Option<i64>,
    #[serde(rename = "timeseries-backend")]
    timeseries_backend: Option<String>,
    #[serde(rename = "timeseries-dbats-opts")]
    timeseries_dbats_opts: Option<String>,
    #[serde(rename = "kafka-brokers")]
    kafka_brokers: Option<String>,
    #[serde(rename = "kafka-topic-prefix")]
    kafka_topic_prefix: Option<String>,
    #[serde(rename = "kafka-channel")]
    kafka_channel: Option<String>,
    #[serde(rename = "kafka-consumer-group")]
    kafka_consumer_group: Option<String>,
    #[serde(rename = "kafka-offset")]
    kafka_offset: Option<String>,
    #[serde(rename = "filter-prefix", default)]
    filter_prefix: Vec<String>,
    #[serde(rename = "stats-interval")]
    stats_interval: Option<i64>,
    #[serde(rename = "stats-ts-backend")]
    stats_ts_backend: Option<String>,
    #[serde(rename = "stats-ts-opts")]
    stats_ts_opts: Option<String>,
}

/// Validated, immutable proxy configuration. Built once in `main` and passed down by
/// shared reference for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub timeseries_backend: String,
    pub timeseries_dbats_opts: String,
    pub kafka_brokers: String,
    pub kafka_topic_prefix: String,
    pub kafka_channel: String,
    pub kafka_consumer_group: String,
    pub kafka_offset: String,
    pub filter_prefix: Vec<String>,
    pub stats_interval_secs: u64,
    pub stats_ts_backend: Option<String>,
    pub stats_ts_opts: String,
}

const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

impl Config {
    pub fn load(path: &Path) -> Result<Config, TimeseriesError> {
        let text = fs::read_to_string(path)
            .map_err(|e| TimeseriesError::Config(format!("opening config file `{}`: {e}", path.display())))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Config, TimeseriesError> {
        let raw: RawConfig = serde_yaml::from_str(text)
            .map_err(|e| TimeseriesError::Config(format!("parsing config: {e}")))?;

        macro_rules! require {
            ($field:ident, $key:literal) => {
                raw.$field
                    .ok_or_else(|| TimeseriesError::Config(format!("missing mandatory config key `{}`", $key)))?
            };
        }

        let filter_prefix = raw.filter_prefix;
        if filter_prefix.len() > MAX_FILTER_PREFIXES {
            return Err(TimeseriesError::Config(format!(
                "filter-prefix lists at most {MAX_FILTER_PREFIXES} entries, got {}",
                filter_prefix.len()
            )));
        }

        let log_level = match raw.log_level {
            Some(n) => LogLevel::from_int(n)
                .ok_or_else(|| TimeseriesError::Config(format!("log-level must be 0, 1 or 2, got {n}")))?,
            None => LogLevel::Info,
        };

        let stats_interval_secs = match raw.stats_interval {
            Some(n) if n > 0 => n as u64,
            Some(n) => {
                return Err(TimeseriesError::Config(format!("stats-interval must be positive, got {n}")))
            }
            None => DEFAULT_STATS_INTERVAL_SECS,
        };

        Ok(Config {
            log_level,
            timeseries_backend: require!(timeseries_backend, "timeseries-backend"),
            timeseries_dbats_opts: require!(timeseries_dbats_opts, "timeseries-dbats-opts"),
            kafka_brokers: require!(kafka_brokers, "kafka-brokers"),
            kafka_topic_prefix: require!(kafka_topic_prefix, "kafka-topic-prefix"),
            kafka_channel: require!(kafka_channel, "kafka-channel"),
            kafka_consumer_group: require!(kafka_consumer_group, "kafka-consumer-group"),
            kafka_offset: require!(kafka_offset, "kafka-offset"),
            filter_prefix,
            stats_interval_secs,
            stats_ts_backend: raw.stats_ts_backend,
            stats_ts_opts: raw.stats_ts_opts.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
timeseries-backend: dbats
timeseries-dbats-opts: ""
kafka-brokers: "localhost:9092"
kafka-topic-prefix: metrics
kafka-channel: prod
kafka-consumer-group: tsk-proxy
kafka-offset: latest
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.stats_interval_secs, DEFAULT_STATS_INTERVAL_SECS);
        assert!(config.filter_prefix.is_empty());
    }

    #[test]
    fn missing_mandatory_key_fails_with_a_specific_message() {
        let text = "timeseries-backend: dbats\n";
        let err = Config::parse(text).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("timeseries-dbats-opts"), "message was: {message}");
    }

    #[test]
    fn rejects_out_of_range_log_level() {
        let text = format!("{MINIMAL}\nlog-level: 5\n");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn accepts_filter_prefix_list() {
        let text = format!("{MINIMAL}\nfilter-prefix:\n  - \"a.\"\n  - \"b.\"\n");
        let config = Config::parse(&text).unwrap();
        assert_eq!(config.filter_prefix, vec!["a.".to_string(), "b.".to_string()]);
    }
}

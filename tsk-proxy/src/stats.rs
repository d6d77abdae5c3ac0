//! The proxy's own operational metrics: a second Key Package, flushed on its own
//! wall-clock interval, independent of the data-path KP.

use crate::config::Config;
use tskfanout::kp::{KeyPackage, ResetMode};

/// Replaces dots with dashes in one path component, so a consumer group or channel
/// containing dots can't be mistaken for additional stat-key path segments.
fn sanitize_component(s: &str) -> String {
    s.replace('.', "-")
}

/// Builds the `systems.services.tsk.<consumer-group>.<topic-prefix>.<channel>` prefix
/// the four stat keys are rooted under.
pub fn stat_key_prefix(config: &Config) -> String {
    format!(
        "systems.services.tsk.{}.{}.{}",
        sanitize_component(&config.kafka_consumer_group),
        sanitize_component(&config.kafka_topic_prefix),
        sanitize_component(&config.kafka_channel),
    )
}

pub struct Stats {
    kp: KeyPackage,
    flush_cnt: usize,
    flushed_key_cnt: usize,
    messages_cnt: usize,
    messages_bytes: usize,
}

impl Stats {
    pub fn new(config: &Config) -> Stats {
        let prefix = stat_key_prefix(config);
        let mut kp = KeyPackage::new(ResetMode::Reset);
        let flush_cnt = kp.add_key(&format!("{prefix}.flush_cnt"));
        let flushed_key_cnt = kp.add_key(&format!("{prefix}.flushed_key_cnt"));
        let messages_cnt = kp.add_key(&format!("{prefix}.messages_cnt"));
        let messages_bytes = kp.add_key(&format!("{prefix}.messages_bytes"));

        for idx in [flush_cnt, flushed_key_cnt, messages_cnt, messages_bytes] {
            kp.enable_key(idx);
        }

        Stats { kp, flush_cnt, flushed_key_cnt, messages_cnt, messages_bytes }
    }

    pub fn record_message(&mut self, byte_len: usize) {
        self.kp.set(self.messages_cnt, self.kp.get_value(self.messages_cnt) + 1);
        self.kp.set(self.messages_bytes, self.kp.get_value(self.messages_bytes) + byte_len as u64);
    }

    pub fn record_flush(&mut self, flushed_key_cnt: usize) {
        self.kp.set(self.flush_cnt, self.kp.get_value(self.flush_cnt) + 1);
        self.kp.set(self.flushed_key_cnt, self.kp.get_value(self.flushed_key_cnt) + flushed_key_cnt as u64);
    }

    pub fn kp_mut(&mut self) -> &mut KeyPackage {
        &mut self.kp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            log_level: tskfanout::logging::LogLevel::Info,
            timeseries_backend: "dbats".into(),
            timeseries_dbats_opts: String::new(),
            kafka_brokers: "localhost:9092".into(),
            kafka_topic_prefix: "metrics".into(),
            kafka_channel: "prod.east".into(),
            kafka_consumer_group: "tsk.proxy".into(),
            kafka_offset: "latest".into(),
            filter_prefix: Vec::new(),
            stats_interval_secs: 60,
            stats_ts_backend: None,
            stats_ts_opts: String::new(),
        }
    }

    #[test]
    fn prefix_replaces_dots_with_dashes_per_component() {
        let prefix = stat_key_prefix(&test_config());
        assert_eq!(prefix, "systems.services.tsk.tsk-proxy.metrics.prod-east");
    }

    #[test]
    fn record_message_and_flush_accumulate() {
        let mut stats = Stats::new(&test_config());
        stats.record_message(128);
        stats.record_message(64);
        stats.record_flush(3);

        assert_eq!(stats.kp.get_value(stats.messages_cnt), 2);
        assert_eq!(stats.kp.get_value(stats.messages_bytes), 192);
        assert_eq!(stats.kp.get_value(stats.flush_cnt), 1);
        assert_eq!(stats.kp.get_value(stats.flushed_key_cnt), 3);
    }
}

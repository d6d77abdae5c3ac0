//! Integration-level scenarios for the proxy's ingest pipeline: the per-message
//! filter/accumulate logic and the flush-on-timestamp-change rule from the ingest
//! state machine, driven directly against the public `tsk_proxy`/`tskfanout` types
//! rather than through the compiled binary (which needs a live Kafka broker to start).

use tsk_proxy::config::Config;
use tsk_proxy::stats::Stats;
use tskfanout::backend::ascii::AsciiBackend;
use tskfanout::{codec, BackendId, KeyPackage, Registry, ResetMode};

fn config() -> Config {
    Config {
        log_level: tskfanout::logging::LogLevel::Error,
        timeseries_backend: "ascii".into(),
        timeseries_dbats_opts: String::new(),
        kafka_brokers: "localhost:9092".into(),
        kafka_topic_prefix: "metrics".into(),
        kafka_channel: "prod".into(),
        kafka_consumer_group: "tsk-proxy-test".into(),
        kafka_offset: "latest".into(),
        filter_prefix: vec!["host.".into()],
        stats_interval_secs: 60,
        stats_ts_backend: None,
        stats_ts_opts: String::new(),
    }
}

/// Exercises the per-message filter/accumulate logic from §4.7's numbered steps over
/// two decoded records: one matching the configured filter prefix, one not.
#[test]
fn filter_prefix_drops_non_matching_keys_and_accumulates_the_rest() {
    let cfg = config();
    let mut kp = KeyPackage::new(ResetMode::Disable);
    let mut stats = Stats::new(&cfg);

    let batch = codec::Batch {
        time: 100,
        channel: "prod".into(),
        records: vec![
            codec::Record { key: "host.cpu".into(), value: 10 },
            codec::Record { key: "other.thing".into(), value: 99 },
        ],
    };
    let encoded = codec::encode(&batch).unwrap();

    let outcome = codec::decode(&encoded).unwrap();
    stats.record_message(encoded.len());
    for record in &outcome.batch.records {
        let passes = cfg.filter_prefix.is_empty()
            || cfg.filter_prefix.iter().any(|p| record.key.starts_with(p.as_str()));
        if !passes {
            continue;
        }
        let idx = kp.get_key(&record.key).unwrap_or_else(|| kp.add_key(&record.key));
        kp.enable_key(idx);
        kp.set(idx, record.value);
    }

    assert_eq!(kp.enabled_size(), 1);
    let idx = kp.get_key("host.cpu").unwrap();
    assert_eq!(kp.get_value(idx), 10);
    assert!(kp.get_key("other.thing").is_none());
}

/// Two messages at the same timestamp accumulate into one KP; a third message at a new
/// timestamp must flush exactly once, carrying the union of keys seen so far, before the
/// new timestamp is adopted — the data-path half of the ingest state machine's §4.7
/// timeline, without the Kafka consumer, which needs a live broker to construct.
#[test]
fn timestamp_change_flushes_exactly_once_with_union_of_keys() {
    let dir = std::env::temp_dir().join(format!("tsk-proxy-flush-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("out.txt");

    let mut registry = Registry::new();
    registry.install(Box::new(AsciiBackend::new(tskfanout::logging::discard()))).unwrap();
    registry.enable(BackendId::Ascii, &format!("-f {}", path.to_str().unwrap())).unwrap();

    let mut kp = KeyPackage::new(ResetMode::Disable);
    let mut current_time = None;
    let mut flush_count = 0;

    let messages = [
        codec::Batch { time: 100, channel: "prod".into(), records: vec![codec::Record { key: "a".into(), value: 1 }] },
        codec::Batch { time: 100, channel: "prod".into(), records: vec![codec::Record { key: "b".into(), value: 2 }] },
        codec::Batch { time: 200, channel: "prod".into(), records: vec![codec::Record { key: "c".into(), value: 3 }] },
    ];

    for batch in &messages {
        if current_time != Some(batch.time) {
            if current_time.is_some() {
                kp.flush(&mut registry, current_time.unwrap()).unwrap();
                flush_count += 1;
            }
            current_time = Some(batch.time);
        }
        for record in &batch.records {
            let idx = kp.get_key(&record.key).unwrap_or_else(|| kp.add_key(&record.key));
            kp.enable_key(idx);
            kp.set(idx, record.value);
        }
    }

    assert_eq!(flush_count, 1, "only the timestamp change should have triggered a flush");
    let ascii_output = std::fs::read_to_string(&path).unwrap();
    assert_eq!(ascii_output, "a 1 100\nb 2 100\n", "flush must carry the union of both same-timestamp messages");

    std::fs::remove_dir_all(&dir).unwrap();
}

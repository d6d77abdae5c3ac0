//! The Kafka/TSK backend: batches KP flushes into TSK-framed (or plain ASCII)
//! messages and publishes them to `"<prefix>.<channel>"`, time-partitioned so every
//! value for one minute lands on the same partition.
//!
//! Built on `rdkafka`'s synchronous `BaseProducer`, which mirrors the teacher's own
//! non-async, poll-driven networking style (`mio`-based rather than `tokio`-based) —
//! the librdkafka background thread does the actual I/O, callbacks fire on whichever
//! thread calls `poll`.

use super::{Backend, BackendId, BulkResolution, KpState};
use crate::codec;
use crate::error::{Result, TimeseriesError};
use crate::kp::KeyPackage;
use crate::logging::{debug, error, info, warn, Logger};
use clap::{Arg, Command};
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
use std::time::Duration;

/// Logical half of the nominal 1 MiB scratch buffer; crossing this triggers a flush.
const BATCH_SOFT_LIMIT: usize = 512 * 1024;
const INITIAL_CONNECT_ATTEMPTS: u32 = 8;
const INITIAL_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(180);
const DRAIN_ATTEMPTS: u32 = 12;
const DRAIN_WAIT: Duration = Duration::from_secs(5);
const QUEUE_FULL_POLL: Duration = Duration::from_millis(1000);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Ascii,
    Tsk,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connected,
    Fatal,
}

pub struct KafkaBackend {
    enabled: bool,
    state: ConnState,
    producer: Option<BaseProducer>,
    brokers: String,
    channel: String,
    topic: String,
    format: OutputFormat,
    partition_count: i32,
    next_partition: i32,
    /// Partition the batch currently accumulating in `scratch` will be sent to, fixed
    /// for the whole batch so a flush mid-batch can't split one minute across partitions.
    time_partition: i32,
    scratch: Vec<u8>,
    log: Logger,
}

impl KafkaBackend {
    pub fn new(log: Logger) -> KafkaBackend {
        KafkaBackend {
            enabled: false,
            state: ConnState::Disconnected,
            producer: None,
            brokers: String::new(),
            channel: String::new(),
            topic: String::new(),
            format: OutputFormat::Tsk,
            partition_count: 0,
            next_partition: 0,
            time_partition: 0,
            scratch: Vec::with_capacity(1024 * 1024),
            log,
        }
    }

    /// Initial connect, per the design doc: up to 8 attempts, exponential backoff
    /// 10s, 20s, 40s, ..., capped at 180s. Also used to reconnect from `Disconnected`
    /// after a transient transport error surfaces at flush time.
    fn connect_with_backoff(&mut self) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=INITIAL_CONNECT_ATTEMPTS {
            match self.try_connect() {
                Ok(()) => {
                    self.state = ConnState::Connected;
                    info!(self.log, "kafka backend connected"; "topic" => &self.topic, "attempt" => attempt);
                    return Ok(());
                }
                Err(e @ TimeseriesError::FatalBus { .. }) => {
                    self.state = ConnState::Fatal;
                    return Err(e);
                }
                Err(e) => {
                    warn!(self.log, "kafka connect attempt failed"; "attempt" => attempt, "error" => %e);
                    last_err = Some(e);
                    if attempt < INITIAL_CONNECT_ATTEMPTS {
                        std::thread::sleep(backoff);
                        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                    }
                }
            }
        }

        self.state = ConnState::Disconnected;
        Err(last_err.unwrap_or(TimeseriesError::TransientBus {
            backend: "kafka",
            message: "connect retries exhausted".into(),
        }))
    }

    fn try_connect(&mut self) -> Result<()> {
        let producer: BaseProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| classify_kafka_error("kafka", e))?;

        let partitions = fetch_partition_count(&producer, &self.topic)?;
        if self.format == OutputFormat::Tsk && 60 % partitions == 0 {
            return Err(TimeseriesError::FatalBus {
                backend: "kafka",
                message: format!(
                    "partition count {partitions} divides evenly into 60; consecutive minutes would collide on a hot partition"
                ),
            });
        }

        self.partition_count = partitions;
        self.producer = Some(producer);
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<()> {
        match self.state {
            ConnState::Connected => Ok(()),
            ConnState::Fatal => Err(TimeseriesError::FatalBus {
                backend: "kafka",
                message: "backend is latched fatal".into(),
            }),
            ConnState::Disconnected => self.connect_with_backoff(),
        }
    }

    /// Sends `payload`, blocking on `poll(1000ms)` and retrying while the producer's
    /// local queue is full. Never drops a message.
    fn send_with_retry(&mut self, payload: &[u8], partition: Option<i32>) -> Result<()> {
        let producer = self.producer.as_ref().ok_or_else(|| TimeseriesError::TransientBus {
            backend: "kafka",
            message: "not connected".into(),
        })?;

        loop {
            let mut record = BaseRecord::to(&self.topic).payload(payload);
            if let Some(p) = partition {
                record = record.partition(p);
            }

            match producer.send(record) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(rdkafka::types::RDKafkaErrorCode::QueueFull), _)) => {
                    producer.poll(QUEUE_FULL_POLL);
                }
                Err((e, _)) => {
                    self.state = ConnState::Disconnected;
                    return Err(classify_kafka_error("kafka", e));
                }
            }
        }
    }

    fn flush_scratch(&mut self) -> Result<()> {
        if self.scratch.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut self.scratch);
        let partition = if self.format == OutputFormat::Tsk { Some(self.time_partition) } else { None };
        let result = self.send_with_retry(&payload, partition);
        self.scratch = Vec::with_capacity(1024 * 1024);
        result
    }

    fn next_round_robin_partition(&mut self) -> i32 {
        let p = self.next_partition;
        self.next_partition = (self.next_partition + 1) % self.partition_count.max(1);
        p
    }
}

/// Maps `(time, partition_count)` to the partition every value for that minute must
/// land on, per the design doc: `(time / 60) mod partition_count`.
pub fn time_partition(time: u32, partition_count: i32) -> i32 {
    ((time / 60) as i64 % partition_count as i64) as i32
}

fn classify_kafka_error(backend: &'static str, e: KafkaError) -> TimeseriesError {
    match e {
        KafkaError::ClientConfig(..) | KafkaError::ClientCreation(_) => {
            TimeseriesError::FatalBus { backend, message: e.to_string() }
        }
        _ => TimeseriesError::TransientBus { backend, message: e.to_string() },
    }
}

fn fetch_partition_count(producer: &BaseProducer, topic: &str) -> Result<i32> {
    let metadata = producer
        .client()
        .fetch_metadata(Some(topic), Duration::from_secs(10))
        .map_err(|e| classify_kafka_error("kafka", e))?;

    let topic_meta = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .ok_or_else(|| TimeseriesError::FatalBus { backend: "kafka", message: format!("topic `{topic}` not found") })?;

    Ok(topic_meta.partitions().len() as i32)
}

impl Backend for KafkaBackend {
    fn id(&self) -> BackendId {
        BackendId::Kafka
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn init(&mut self, argv: &[String]) -> Result<()> {
        let matches = Command::new("kafka")
            .no_binary_name(true)
            .arg(Arg::new("brokers").short('b').required(true))
            .arg(Arg::new("channel").short('c').required(true))
            .arg(Arg::new("codec").short('C'))
            .arg(Arg::new("format").short('f'))
            .arg(Arg::new("prefix").short('p').required(true))
            .try_get_matches_from(argv)
            .map_err(|e| TimeseriesError::Config(format!("kafka backend: {e}")))?;

        self.brokers = matches.get_one::<String>("brokers").unwrap().clone();
        self.channel = matches.get_one::<String>("channel").unwrap().clone();
        if self.channel.len() > 1024 {
            return Err(TimeseriesError::Config("kafka backend: channel name exceeds 1024 bytes".into()));
        }
        let prefix = matches.get_one::<String>("prefix").unwrap().clone();
        self.topic = format!("{prefix}.{}", self.channel);

        self.format = match matches.get_one::<String>("format").map(String::as_str) {
            Some("ascii") => OutputFormat::Ascii,
            Some("tsk") | None => OutputFormat::Tsk,
            Some(other) => {
                return Err(TimeseriesError::Config(format!("kafka backend: unknown format `{other}`")))
            }
        };

        self.connect_with_backoff()?;
        self.enabled = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(producer) = self.producer.take() {
            for attempt in 1..=DRAIN_ATTEMPTS {
                match producer.flush(DRAIN_WAIT) {
                    Ok(()) => break,
                    Err(e) if attempt == DRAIN_ATTEMPTS => {
                        error!(self.log, "kafka producer drain timed out"; "error" => %e);
                    }
                    Err(_) => continue,
                }
            }
        }
        self.enabled = false;
        self.state = ConnState::Disconnected;
        Ok(())
    }

    fn resolve_key(&mut self, key: &str) -> Result<Vec<u8>> {
        Ok(key.as_bytes().to_vec())
    }

    fn resolve_key_bulk(&mut self, keys: &[&str]) -> Result<(Vec<Vec<u8>>, BulkResolution)> {
        Ok((keys.iter().map(|k| k.as_bytes().to_vec()).collect(), BulkResolution { ids: false }))
    }

    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<()> {
        self.ensure_connected()?;
        match self.format {
            OutputFormat::Ascii => {
                let line = format!("{key} {value} {time}\n");
                let partition = self.next_round_robin_partition();
                self.send_with_retry(line.as_bytes(), Some(partition))
            }
            OutputFormat::Tsk => {
                let mut buf = Vec::new();
                codec::encode_header(&mut buf, time, &self.channel)?;
                codec::encode_record(&mut buf, key, value)?;
                let partition = time_partition(time, self.partition_count);
                self.send_with_retry(&buf, Some(partition))
            }
        }
    }

    fn set_single_by_id(&mut self, id: &[u8], value: u64, time: u32) -> Result<()> {
        let key = std::str::from_utf8(id)
            .map_err(|_| TimeseriesError::Resolve { backend: "kafka", key: String::from_utf8_lossy(id).into_owned() })?;
        self.set_single(key, value, time)
    }

    fn set_bulk_init(&mut self, _key_cnt: usize, time: u32) -> Result<()> {
        self.ensure_connected()?;
        self.scratch.clear();
        if self.format == OutputFormat::Tsk {
            codec::encode_header(&mut self.scratch, time, &self.channel)?;
        }
        Ok(())
    }

    fn set_bulk_by_id(&mut self, id: &[u8], value: u64) -> Result<()> {
        let key = std::str::from_utf8(id)
            .map_err(|_| TimeseriesError::Resolve { backend: "kafka", key: String::from_utf8_lossy(id).into_owned() })?;

        match self.format {
            OutputFormat::Ascii => {
                debug!(self.log, "kafka ascii bulk write is repeated singles"; "key" => key);
                Err(TimeseriesError::NotImplemented("kafka"))
            }
            OutputFormat::Tsk => {
                codec::encode_record(&mut self.scratch, key, value)?;
                if self.scratch.len() > BATCH_SOFT_LIMIT {
                    self.flush_scratch()?;
                }
                Ok(())
            }
        }
    }

    fn kp_init(&mut self) -> Option<KpState> {
        None
    }

    fn kp_free(&mut self, _state: Option<KpState>) {}

    fn kp_flush(&mut self, kp: &mut KeyPackage, time: u32) -> Result<()> {
        self.ensure_connected()?;

        match self.format {
            OutputFormat::Ascii => {
                let rows: Vec<(String, u64)> =
                    kp.iter_enabled().map(|(_, r)| (r.key().to_string(), r.value())).collect();
                for (key, value) in rows {
                    self.set_single(&key, value, time)?;
                }
                Ok(())
            }
            OutputFormat::Tsk => {
                self.scratch.clear();
                self.time_partition = time_partition(time, self.partition_count);
                codec::encode_header(&mut self.scratch, time, &self.channel)?;

                let rows: Vec<(String, u64)> =
                    kp.iter_enabled().map(|(_, r)| (r.key().to_string(), r.value())).collect();

                for (key, value) in rows {
                    codec::encode_record(&mut self.scratch, &key, value)?;
                    if self.scratch.len() > BATCH_SOFT_LIMIT {
                        self.flush_scratch()?;
                        codec::encode_header(&mut self.scratch, time, &self.channel)?;
                    }
                }

                // Trailing message, always sent even if it's just the header.
                self.flush_scratch()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worked_example_partition_7() {
        assert_eq!(time_partition(120, 7), 2);
    }

    #[test]
    fn worked_example_partition_6_consecutive_minutes_distinct() {
        let partitions: Vec<_> = [120, 180, 240].iter().map(|&t| time_partition(t, 6)).collect();
        assert_eq!(partitions, vec![2, 3, 4]);
        let unique: std::collections::HashSet<_> = partitions.iter().collect();
        assert_eq!(unique.len(), partitions.len());
    }

    #[test]
    fn partition_count_must_not_divide_60() {
        for bad in [1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60] {
            assert_eq!(60 % bad, 0, "expected {bad} to be a divisor of 60 for this test to be meaningful");
        }
    }
}

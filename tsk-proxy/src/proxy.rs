//! The ingest state machine: consume TSK batches from Kafka, demultiplex by channel,
//! filter by key prefix, re-accumulate into a downstream Key Package, and flush it on
//! timestamp advance — mirroring the `ConnState` enum the fan-out library's own Kafka
//! backend uses for its much smaller connect/send state machine.

use crate::config::Config;
use crate::shutdown::ShutdownToken;
use crate::stats::Stats;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::Message;
use std::time::{Duration, Instant};
use tskfanout::codec;
use tskfanout::kp::{KeyPackage, ResetMode};
use tskfanout::logging::{debug, error, info, warn, Logger};
use tskfanout::{Registry, TimeseriesError};

/// How long one `poll` call blocks waiting for the next message.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Consecutive EOF-without-data polls after which the KP is flushed even though no new
/// timestamp has arrived, so a quiet topic doesn't leave data sitting unflushed.
const EOF_FLUSH_THRESHOLD: u32 = 10;

/// Compares `expected` and `got` over their shorter length only, so e.g. configured
/// channel `"prod"` matches an incoming `"pro"` (and vice versa) rather than being
/// rejected as a mismatch.
fn channel_matches(expected: &str, got: &str) -> bool {
    let len = expected.len().min(got.len());
    expected.as_bytes()[..len] == got.as_bytes()[..len]
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Init,
    Consuming,
    Flushing,
    Draining,
    Done,
}

pub struct Proxy {
    state: State,
    config: Config,
    consumer: BaseConsumer,
    registry: Registry,
    kp: KeyPackage,
    stats: Stats,
    current_time: Option<u32>,
    eof_since_data: u32,
    last_stats_flush: Instant,
    shutdown: ShutdownToken,
    log: Logger,
}

impl Proxy {
    /// Builds the consumer, subscribes to the configured topic, and enables the
    /// downstream backend named by `timeseries-backend` (and, if set, the separate
    /// stats backend) on `registry`. Moves to `CONSUMING` only once both have
    /// succeeded, per the state machine's INIT transition.
    pub fn new(
        config: Config,
        mut registry: Registry,
        shutdown: ShutdownToken,
        log: Logger,
    ) -> Result<Proxy, TimeseriesError> {
        let topic = format!("{}.{}", config.kafka_topic_prefix, config.kafka_channel);

        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_offset)
            .set("enable.partition.eof", "true")
            .create()
            .map_err(|e| TimeseriesError::FatalBus { backend: "kafka", message: e.to_string() })?;

        consumer
            .subscribe(&[&topic])
            .map_err(|e| TimeseriesError::FatalBus { backend: "kafka", message: e.to_string() })?;

        registry
            .enable(
                tskfanout::BackendId::from_name(&config.timeseries_backend).ok_or_else(|| {
                    TimeseriesError::Config(format!("unknown timeseries-backend `{}`", config.timeseries_backend))
                })?,
                &config.timeseries_dbats_opts,
            )
            .map_err(|e| TimeseriesError::Config(format!("starting timeseries-backend: {e}")))?;

        if let Some(stats_backend) = &config.stats_ts_backend {
            let id = tskfanout::BackendId::from_name(stats_backend).ok_or_else(|| {
                TimeseriesError::Config(format!("unknown stats-ts-backend `{stats_backend}`"))
            })?;
            registry
                .enable(id, &config.stats_ts_opts)
                .map_err(|e| TimeseriesError::Config(format!("starting stats-ts-backend: {e}")))?;
        }

        info!(log, "subscribed"; "topic" => &topic, "group" => &config.kafka_consumer_group);

        let stats = Stats::new(&config);
        Ok(Proxy {
            state: State::Consuming,
            config,
            consumer,
            registry,
            kp: KeyPackage::new(ResetMode::Disable),
            stats,
            current_time: None,
            eof_since_data: 0,
            last_stats_flush: Instant::now(),
            shutdown,
            log,
        })
    }

    /// Runs the consume/flush loop until SIGINT drains it to `DONE`. Returns once the
    /// process should exit; the caller maps that to an exit code.
    pub fn run(&mut self) -> Result<(), TimeseriesError> {
        loop {
            if self.shutdown.hard_exit_requested() {
                warn!(self.log, "third SIGINT received, exiting immediately");
                self.state = State::Done;
                return Ok(());
            }

            match self.state {
                State::Init => unreachable!("Proxy::new already advances past INIT"),
                State::Consuming => self.step_consuming()?,
                State::Flushing => self.step_flushing(false)?,
                State::Draining => {
                    self.step_flushing(true)?;
                    self.state = State::Done;
                }
                State::Done => return Ok(()),
            }
        }
    }

    /// Polls for one message (or timeout), processes it if present, and decides
    /// whether a flush is now due.
    fn step_consuming(&mut self) -> Result<(), TimeseriesError> {
        if self.shutdown.shutdown_requested() {
            info!(self.log, "SIGINT received, draining");
            self.state = State::Draining;
            return Ok(());
        }

        if self.stats_interval_elapsed() {
            self.flush_stats();
        }

        match self.consumer.poll(POLL_TIMEOUT) {
            Some(Ok(message)) => {
                self.eof_since_data = 0;
                let payload = message.payload().unwrap_or(&[]);
                self.process_message(payload);
            }
            Some(Err(e)) => {
                warn!(self.log, "kafka consume error"; "error" => %e);
            }
            None => {
                self.eof_since_data += 1;
                if self.eof_since_data >= EOF_FLUSH_THRESHOLD && self.current_time.is_some() {
                    self.state = State::Flushing;
                }
            }
        }

        Ok(())
    }

    /// Decodes and applies one TSK batch, per §4.7's per-message processing steps.
    /// Parse errors and channel mismatches are logged and the message is skipped;
    /// nothing else in the pipeline is fatal to the consume loop.
    fn process_message(&mut self, payload: &[u8]) {
        self.stats.record_message(payload.len());

        let outcome = match codec::decode(payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(self.log, "dropping malformed message"; "error" => %e);
                return;
            }
        };
        let batch = outcome.batch;

        if !channel_matches(&self.config.kafka_channel, &batch.channel) {
            debug!(self.log, "dropping message for unconfigured channel";
                "expected" => &self.config.kafka_channel, "got" => &batch.channel);
            return;
        }

        if self.current_time != Some(batch.time) {
            if self.current_time.is_some() {
                self.state = State::Flushing;
            }
            self.current_time = Some(batch.time);
        }

        for record in &batch.records {
            if !self.passes_filter(&record.key) {
                continue;
            }

            let idx = self.kp.get_key(&record.key).unwrap_or_else(|| self.kp.add_key(&record.key));
            self.kp.enable_key(idx);
            self.kp.set(idx, record.value);
        }
    }

    fn passes_filter(&self, key: &str) -> bool {
        self.config.filter_prefix.is_empty()
            || self.config.filter_prefix.iter().any(|prefix| key.starts_with(prefix.as_str()))
    }

    /// Flushes the data-path KP at `current_time`. `force` is set from `DRAINING`,
    /// where the flush happens regardless of whether a new timestamp triggered it.
    fn step_flushing(&mut self, force: bool) -> Result<(), TimeseriesError> {
        let time = match self.current_time {
            Some(t) => t,
            None => {
                self.state = if force { State::Done } else { State::Consuming };
                return Ok(());
            }
        };

        let flushed_keys = self.kp.enabled_size();
        match self.kp.flush(&mut self.registry, time) {
            Ok(()) => {
                self.stats.record_flush(flushed_keys);
            }
            Err(e) => {
                error!(self.log, "flush failed"; "error" => %e, "time" => time);
            }
        }

        self.eof_since_data = 0;
        self.state = if force { State::Done } else { State::Consuming };
        Ok(())
    }

    fn stats_interval_elapsed(&self) -> bool {
        self.last_stats_flush.elapsed() >= Duration::from_secs(self.config.stats_interval_secs)
    }

    fn flush_stats(&mut self) {
        let time = self.current_time.unwrap_or(0);
        if let Err(e) = self.stats.kp_mut().flush(&mut self.registry, time) {
            warn!(self.log, "stats flush failed"; "error" => %e);
        }
        self.last_stats_flush = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_matches_compares_only_the_shorter_length() {
        assert!(channel_matches("prod", "prod"));
        assert!(channel_matches("prod", "pro"));
        assert!(channel_matches("pro", "prod"));
        assert!(!channel_matches("prod", "dev"));
    }
}

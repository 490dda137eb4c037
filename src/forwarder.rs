//! The stream loop: one sequential worker per adapter that turns inbound
//! log records into outbound records and hands them to the sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::Receiver;

use crate::record::{LogRecord, OutboundRecord};
use crate::sink::{RecordSink, SinkError};
use crate::tag::TagConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Running,
    Terminated,
}

#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub received: AtomicU64,
    pub skipped: AtomicU64,
    pub forwarded: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub skipped: u64,
    pub forwarded: u64,
    pub failed: u64,
}

impl ForwarderStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct Forwarder {
    name: String,
    tags: TagConfig,
    sink: Box<dyn RecordSink>,
    state: ForwarderState,
    stats: Arc<ForwarderStats>,
}

impl Forwarder {
    pub fn new(name: impl Into<String>, tags: TagConfig, sink: Box<dyn RecordSink>) -> Self {
        Self {
            name: name.into(),
            tags,
            sink,
            state: ForwarderState::Running,
            stats: Arc::new(ForwarderStats::default()),
        }
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until the inbound channel is closed. Per-record failures are
    /// logged and never stop the loop.
    pub async fn run(&mut self, mut records: Receiver<LogRecord>) {
        log::info!(
            "{} adapter streaming to {}",
            self.name,
            self.sink.target()
        );

        while let Some(record) = records.recv().await {
            self.handle(record).await;
        }

        self.sink.close().await;
        self.state = ForwarderState::Terminated;

        let stats = self.stats.snapshot();
        log::info!(
            "{} adapter stopped: {} received, {} forwarded, {} skipped, {} failed",
            self.name,
            stats.received,
            stats.forwarded,
            stats.skipped,
            stats.failed
        );
    }

    async fn handle(&mut self, record: LogRecord) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        if record.is_blank() {
            log::info!(
                "Skipping empty message from container {}",
                record.container.id
            );
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let tag = self.tags.tag_for(&record);
        let outbound = OutboundRecord::new(tag, &record);
        log::debug!("{} {} {:?}", outbound.tag, outbound.time, outbound.fields);

        match self.sink.send(&outbound).await {
            Ok(()) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(e, SinkError::Encoding(_)) {
                    log::error!("fluentd-adapter: dropping unencodable record: {e}");
                } else {
                    log::error!("fluentd-adapter: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::connection::tests::{Script, manager};
    use crate::encoder::{Encoder, decode};
    use crate::record::test_record;
    use crate::sink::RawSink;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::io::ErrorKind;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    thread_local! {
        static CAPTURED: RefCell<Vec<(log::Level, String)>> = const { RefCell::new(Vec::new()) };
    }

    /// Keeps log lines per thread; each `#[tokio::test]` runs on its own thread.
    struct CaptureLogger;

    impl log::Log for CaptureLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            CAPTURED.with(|lines| {
                lines
                    .borrow_mut()
                    .push((record.level(), record.args().to_string()))
            });
        }

        fn flush(&self) {}
    }

    static LOGGER: CaptureLogger = CaptureLogger;

    fn capture_logs() {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Trace);
        CAPTURED.with(|lines| lines.borrow_mut().clear());
    }

    fn logged(level: log::Level, needle: &str) -> Vec<String> {
        CAPTURED.with(|lines| {
            lines
                .borrow()
                .iter()
                .filter(|(l, line)| *l == level && line.contains(needle))
                .map(|(_, line)| line.clone())
                .collect()
        })
    }

    #[derive(Default)]
    struct Recorded {
        sent: Mutex<Vec<OutboundRecord>>,
        closed: Mutex<bool>,
    }

    struct RecordingSink {
        recorded: Arc<Recorded>,
        fail: bool,
    }

    #[async_trait]
    impl RecordSink for RecordingSink {
        fn target(&self) -> &str {
            "memory"
        }

        async fn send(&mut self, record: &OutboundRecord) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Encoding(
                    crate::encoder::EncodingError::TimestampOutOfRange(0),
                ));
            }
            self.recorded.sent.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn close(&mut self) {
            *self.recorded.closed.lock().unwrap() = true;
        }
    }

    fn tags() -> TagConfig {
        TagConfig {
            prefix: "docker".to_string(),
            suffix_label: "svc".to_string(),
            ..Default::default()
        }
    }

    fn recording(fail: bool) -> (Forwarder, Arc<Recorded>) {
        let recorded = Arc::new(Recorded::default());
        let sink = RecordingSink {
            recorded: Arc::clone(&recorded),
            fail,
        };
        (Forwarder::new("fluentd", tags(), Box::new(sink)), recorded)
    }

    async fn feed(forwarder: &mut Forwarder, records: Vec<LogRecord>) {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for record in records {
            tx.send(record).await.unwrap();
        }
        drop(tx);
        forwarder.run(rx).await;
    }

    #[tokio::test]
    async fn test_forwards_fixed_shape_record() {
        let (mut forwarder, recorded) = recording(false);
        assert_eq!(forwarder.state(), ForwarderState::Running);

        feed(&mut forwarder, vec![test_record("hello")]).await;

        let sent = recorded.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tag, "docker.api");
        let expected = BTreeMap::from([
            ("log".to_string(), "hello".to_string()),
            ("container_id".to_string(), "abc123".to_string()),
            ("container_name".to_string(), "web".to_string()),
            ("source".to_string(), "stdout".to_string()),
        ]);
        assert_eq!(sent[0].fields, expected);
        assert_eq!(forwarder.state(), ForwarderState::Terminated);
        assert!(*recorded.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_blank_records_never_reach_the_sink() {
        let (mut forwarder, recorded) = recording(false);
        let stats = forwarder.stats();

        feed(
            &mut forwarder,
            vec![test_record("   "), test_record(""), test_record("\t\n")],
        )
        .await;

        assert!(recorded.sent.lock().unwrap().is_empty());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 3);
        assert_eq!(snapshot.skipped, 3);
        assert_eq!(snapshot.forwarded, 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let (mut forwarder, _recorded) = recording(true);
        let stats = forwarder.stats();

        feed(
            &mut forwarder,
            vec![test_record("a"), test_record("b"), test_record("c")],
        )
        .await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed, 3);
        assert_eq!(forwarder.state(), ForwarderState::Terminated);
    }

    #[tokio::test]
    async fn test_preserves_arrival_order() {
        let (mut forwarder, recorded) = recording(false);
        let records = (0..20).map(|i| test_record(&format!("line {i}"))).collect();

        feed(&mut forwarder, records).await;

        let sent = recorded.sent.lock().unwrap();
        let logs: Vec<_> = sent.iter().map(|r| r.fields["log"].clone()).collect();
        let expected: Vec<_> = (0..20).map(|i| format!("line {i}")).collect();
        assert_eq!(logs, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitespace_record_writes_nothing_on_the_wire() {
        capture_logs();
        let script = Script::failing_writes([]);
        let sink = RawSink::new(Encoder::default(), manager(&script).await);
        let mut forwarder = Forwarder::new("fluentd", tags(), Box::new(sink));

        feed(&mut forwarder, vec![test_record("   ")]).await;

        assert_eq!(script.write_attempts.load(Ordering::SeqCst), 0);
        let skipped = logged(log::Level::Info, "Skipping empty message");
        assert_eq!(skipped, vec!["Skipping empty message from container abc123"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_timeouts_without_reconnect() {
        capture_logs();
        let script = Script::failing_writes([ErrorKind::TimedOut, ErrorKind::TimedOut]);
        let sink = RawSink::new(Encoder::default(), manager(&script).await);
        let mut forwarder = Forwarder::new("fluentd", tags(), Box::new(sink));
        let stats = forwarder.stats();

        feed(&mut forwarder, vec![test_record("hello")]).await;

        assert_eq!(script.write_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(script.dial_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().forwarded, 1);

        assert_eq!(logged(log::Level::Warn, "Temporary error writing").len(), 1);
        assert_eq!(logged(log::Level::Warn, "Write attempt 2/11").len(), 1);
        assert_eq!(logged(log::Level::Info, "succeeded on attempt 3").len(), 1);
        assert!(logged(log::Level::Info, "Reconnected").is_empty());

        let written = script.written.lock().unwrap();
        let decoded = decode(&written[0]).expect("Failed to decode");
        assert_eq!(decoded.tag, "docker.api");
        assert_eq!(decoded.fields["log"], "hello");
        assert_eq!(decoded.fields["container_id"], "abc123");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drops_record_and_continues() {
        let script = Script::failing_writes([ErrorKind::ConnectionReset]);
        let sink = RawSink::new(Encoder::default(), manager(&script).await);
        let mut forwarder = Forwarder::new("fluentd", tags(), Box::new(sink));
        let stats = forwarder.stats();

        feed(
            &mut forwarder,
            vec![test_record("lost"), test_record("delivered")],
        )
        .await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.forwarded, 1);
        let written = script.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(
            decode(&written[0]).expect("Failed to decode").fields["log"],
            "delivered"
        );
    }
}

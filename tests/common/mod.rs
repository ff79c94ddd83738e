#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use portcullis::{
    GateBuilder, GateConfig, InMemoryStore, InstantSleeper, ManualClock, MemoryAuditSink,
    RequestGate, WriteRetry,
};
use tracing_subscriber::fmt::MakeWriter;

pub const LOGIN: &str = "/api/auth/login";
pub const START_MILLIS: u64 = 1_700_000_000_000;

pub struct Harness {
    pub gate: RequestGate,
    pub store: InMemoryStore,
    pub clock: ManualClock,
    pub audit: MemoryAuditSink,
}

pub fn harness(config: GateConfig) -> Harness {
    harness_on(config, InMemoryStore::new(), ManualClock::new(START_MILLIS))
}

/// Gate over an existing store and clock, e.g. to simulate a restart.
pub fn harness_on(config: GateConfig, store: InMemoryStore, clock: ManualClock) -> Harness {
    let audit = MemoryAuditSink::new();
    let gate = GateBuilder::new()
        .config(config)
        .store(Arc::new(store.clone()))
        .clock(Arc::new(clock.clone()))
        .audit_sink(Arc::new(audit.clone()))
        .write_retry(WriteRetry::new(2, Duration::from_millis(1)).with_sleeper(InstantSleeper))
        .build()
        .expect("valid config");
    Harness { gate, store, clock, audit }
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogGuard;
    fn make_writer(&'a self) -> Self::Writer {
        LogGuard(self.0.clone())
    }
}

pub struct LogGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install a thread-local subscriber writing into the returned buffer.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hookrelay::{EventData, WebhookConfig};
use serde_json::Value;

/// Small pool, short retry delays, real HTTP.
pub fn fast_config() -> WebhookConfig {
    WebhookConfig {
        workers: 2,
        queue_size: 64,
        retry_queue_size: 64,
        timeout_ms: 2_000,
        max_retries: 3,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        shutdown_timeout_ms: 2_000,
        ..WebhookConfig::default()
    }
}

pub fn data(value: Value) -> EventData {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Poll `check` every 10ms until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory log sink for a `tracing_subscriber::fmt` subscriber.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

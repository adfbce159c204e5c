//! Access-log event emission (spec §4.7, §5).
//!
//! Formatting is explicitly out of scope (spec §1); this module only owns
//! getting a structured event off the event loop without blocking it. If
//! the sink is full, entries are dropped — spec §5: "if the sink is full,
//! entries are dropped rather than blocking the loop".

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;

/// One access-log-worthy fact about a completed cycle.
#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
    pub client: Option<IpAddr>,
}

/// A bounded, non-blocking fan-out point for [`AccessLogEvent`]s. The
/// receiving half is owned by whatever external formatter/sink a front-end
/// wires up; this crate never formats a log line itself.
#[derive(Clone)]
pub struct AccessLogSink {
    tx: mpsc::Sender<AccessLogEvent>,
}

impl AccessLogSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AccessLogEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Emit an event, dropping it silently if the sink is saturated.
    pub fn emit(&self, event: AccessLogEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("access log sink full or closed, dropping entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_sink_drops_rather_than_blocks() {
        let (sink, mut rx) = AccessLogSink::new(1);
        let event = || AccessLogEvent {
            method: "GET".into(),
            path: "/".into(),
            status: 200,
            duration: Duration::from_millis(1),
            client: None,
        };
        sink.emit(event());
        sink.emit(event()); // dropped, must not block
        sink.emit(event()); // dropped
        let received = rx.recv().await.unwrap();
        assert_eq!(received.status, 200);
        assert!(rx.try_recv().is_err());
    }
}

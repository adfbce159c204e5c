//! The scope/message bridge (spec §4.5): the two endpoints an application
//! task uses to talk to the active protocol state machine.
//!
//! The bridge itself is deliberately thin — a bounded channel pair, so
//! neither side buffers unboundedly and backpressure flows naturally from
//! the network to the application and back. Event-order enforcement (spec
//! §4.2/§4.4's "must send exactly one `http.response.start` first", etc.)
//! lives in the consuming state machine ([`crate::http::cycle`],
//! [`crate::websocket::cycle`]), not here — the bridge doesn't know which
//! cycle kind it's wired into.

use tokio::sync::mpsc;

use crate::event::{ReceiveEvent, SendEvent};
use crate::error::Error;

/// Channel depth for both directions of the bridge. Small on purpose: the
/// point is to apply backpressure, not to let an application get far ahead
/// of the network.
const CHANNEL_CAPACITY: usize = 8;

/// The application-facing half of the inbound direction (protocol → app).
pub struct Receiver {
    rx: mpsc::Receiver<ReceiveEvent>,
    /// Handed to the application if the feed is dropped (task panic, force
    /// teardown) without the protocol ever explicitly feeding a disconnect
    /// event itself. `None` once used, so a closed channel after that point
    /// doesn't synthesize a second one.
    fallback_disconnect: Option<ReceiveEvent>,
}

/// The protocol-facing half of the inbound direction (protocol → app).
pub struct ReceiveFeed {
    tx: mpsc::Sender<ReceiveEvent>,
}

/// The application-facing half of the outbound direction (app → protocol).
pub struct Sender {
    tx: mpsc::Sender<SendEvent>,
}

/// The protocol-facing half of the outbound direction (app → protocol).
pub struct SendSink {
    rx: mpsc::Receiver<SendEvent>,
}

/// Build both directions of a bridge for one cycle. `fallback_disconnect`
/// is the event synthesized if the feed is ever dropped without the
/// protocol having explicitly fed a disconnect first — callers normally
/// feed `http.disconnect`/`websocket.disconnect` explicitly when they
/// observe the reason (spec §4.2/§4.4), so this is a safety net, not the
/// primary path.
pub fn new_bridge(fallback_disconnect: ReceiveEvent) -> (Receiver, ReceiveFeed, Sender, SendSink) {
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        Receiver {
            rx: in_rx,
            fallback_disconnect: Some(fallback_disconnect),
        },
        ReceiveFeed { tx: in_tx },
        Sender { tx: out_tx },
        SendSink { rx: out_rx },
    )
}

impl Receiver {
    /// Yield the next queued inbound event, or the cycle's disconnect event
    /// exactly once if the feed has been closed and nothing is queued.
    pub async fn receive(&mut self) -> ReceiveEvent {
        match self.rx.recv().await {
            Some(event) => {
                if matches!(
                    event,
                    ReceiveEvent::HttpDisconnect | ReceiveEvent::WebSocketDisconnect { .. }
                ) {
                    self.fallback_disconnect = None;
                }
                event
            }
            None => match self.fallback_disconnect.take() {
                Some(event) => event,
                // Channel closed and we already told the application once;
                // park forever rather than synthesize a second disconnect.
                None => std::future::pending().await,
            },
        }
    }
}

impl ReceiveFeed {
    /// Queue an inbound event for the application. Applies backpressure:
    /// if the application hasn't consumed earlier events, this waits.
    pub async fn feed(&self, event: ReceiveEvent) -> Result<(), Error> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::transport_lost("receive endpoint dropped"))
    }
}

impl Sender {
    /// Hand an outbound event to the protocol. Respects cancellation: if
    /// the task is cancelled while awaiting capacity, the send future is
    /// simply dropped, per spec §5 "late send is discarded silently".
    pub async fn send(&self, event: SendEvent) -> Result<(), Error> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::transport_lost("send endpoint dropped"))
    }
}

impl SendSink {
    /// Pull the next outbound event queued by the application, or `None`
    /// once the application task has finished and dropped its [`Sender`].
    pub async fn next(&mut self) -> Option<SendEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_is_synthesized_exactly_once_on_drop() {
        let (mut receiver, feed, _sender, _sink) = new_bridge(ReceiveEvent::HttpDisconnect);
        drop(feed);
        assert!(matches!(
            receiver.receive().await,
            ReceiveEvent::HttpDisconnect
        ));
        // A second poll must not resolve with another disconnect; confirm
        // the first branch path is the one recorded by checking the flag
        // indirectly: request with a timeout and expect no event.
        let second = tokio::time::timeout(std::time::Duration::from_millis(20), receiver.receive()).await;
        assert!(second.is_err(), "receive must not resolve a second time");
    }

    #[tokio::test]
    async fn queued_events_are_delivered_in_order() {
        let (mut receiver, feed, _sender, _sink) = new_bridge(ReceiveEvent::HttpDisconnect);
        feed.feed(ReceiveEvent::HttpRequest {
            body: bytes::Bytes::from_static(b"a"),
            more_body: true,
        })
        .await
        .unwrap();
        feed.feed(ReceiveEvent::HttpRequest {
            body: bytes::Bytes::from_static(b"b"),
            more_body: false,
        })
        .await
        .unwrap();

        let first = receiver.receive().await;
        let second = receiver.receive().await;
        match (first, second) {
            (
                ReceiveEvent::HttpRequest { body: a, .. },
                ReceiveEvent::HttpRequest { body: b, .. },
            ) => {
                assert_eq!(a.as_ref(), b"a");
                assert_eq!(b.as_ref(), b"b");
            }
            _ => panic!("unexpected event kind"),
        }
    }
}

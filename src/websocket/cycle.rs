//! The WebSocket handshake negotiation and post-upgrade frame loop (spec
//! §4.4 steps 2-5).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http::{request::Parts, HeaderValue, Response};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::{
    self as ts,
    error::Error as TungsteniteError,
    protocol::{CloseFrame, WebSocketConfig},
};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::app::DynApplication;
use crate::bridge::{new_bridge, ReceiveFeed, SendSink};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionManager, Role};
use crate::event::{ReceiveEvent, SendEvent, WebSocketMessage};
use crate::http::cycle::ResponseBody;
use crate::scope::Scope;

use super::handshake::{accept_response, build_websocket_scope, deny_response};

/// RFC 6455's "abnormal closure" code: the fallback the bridge synthesizes
/// for a WebSocket cycle whose feed was dropped without an explicit
/// disconnect (spec §5's disconnect-exactly-once guarantee applied to the
/// WebSocket event shape instead of the HTTP one).
const ABNORMAL_CLOSURE: u16 = 1006;

/// Negotiate a WebSocket upgrade and return the response hyper should send.
///
/// Builds the scope, dispatches `websocket.connect`, then waits (bounded by
/// `config.websocket_handshake_timeout`) for the application's first reply.
/// On accept, spawns a task that awaits the actual IO upgrade and runs the
/// frame loop; the 101 response this function returns is what lets that
/// upgrade complete. On deny or timeout, no upgrade task is spawned.
pub async fn negotiate_handshake(
    app: Arc<dyn DynApplication>,
    parts: &Parts,
    sec_websocket_key: HeaderValue,
    on_upgrade: hyper::upgrade::OnUpgrade,
    connection: &Connection,
    config: Arc<ServerConfig>,
    cancellation: CancellationToken,
    tls: bool,
    manager: Arc<ConnectionManager>,
) -> Response<ResponseBody> {
    let scope = match build_websocket_scope(parts, connection, &config, tls) {
        Ok(scope) => scope,
        Err(_) => return deny_response(&config),
    };
    tracing::debug!(path = %scope.path, scheme = scope.ws_scheme(), "negotiating websocket handshake");

    let (receiver, feed, sender, mut sink) = new_bridge(ReceiveEvent::WebSocketDisconnect {
        code: ABNORMAL_CLOSURE,
    });

    let app_task = tokio::spawn(async move {
        if let Err(e) = app.call(Scope::WebSocket(scope), receiver, sender).await {
            tracing::error!(kind = ?e.kind(), "websocket application task failed: {e}");
        }
    });

    if feed.feed(ReceiveEvent::WebSocketConnect).await.is_err() {
        return deny_response(&config);
    }

    let first_event = tokio::select! {
        biased;
        _ = cancellation.cancelled() => None,
        _ = tokio::time::sleep(config.websocket_handshake_timeout) => None,
        event = sink.next() => event,
    };

    match first_event {
        Some(SendEvent::WebSocketAccept { subprotocol, headers }) => {
            match accept_response(&sec_websocket_key, subprotocol.as_deref(), &headers, &config) {
                Ok(response) => {
                    manager.set_role(connection.id, Role::WebSocket);
                    tokio::spawn(run_after_upgrade(
                        on_upgrade,
                        feed,
                        sink,
                        app_task,
                        config,
                        cancellation,
                    ));
                    response
                }
                Err(_) => deny_response(&config),
            }
        }
        _ => {
            drop(feed);
            drop(sink);
            app_task.abort();
            deny_response(&config)
        }
    }
}

async fn run_after_upgrade(
    on_upgrade: hyper::upgrade::OnUpgrade,
    feed: ReceiveFeed,
    sink: SendSink,
    app_task: tokio::task::JoinHandle<()>,
    config: Arc<ServerConfig>,
    cancellation: CancellationToken,
) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::debug!("websocket upgrade failed: {e}");
            app_task.abort();
            return;
        }
    };
    let io = TokioIo::new(upgraded);

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.websocket_max_message_size);

    let stream = WebSocketStream::from_raw_socket(io, ts::protocol::Role::Server, Some(ws_config)).await;

    drive_websocket_cycle(stream, feed, sink, &config, cancellation).await;

    let abort_handle = app_task.abort_handle();
    if tokio::time::timeout(config.application_close_timeout, app_task).await.is_err() {
        abort_handle.abort();
        tracing::debug!("application task outlived close-timeout, aborting");
    }
}

/// Run the post-handshake frame loop (spec §4.4 "Framing", "Disconnect",
/// "Group-expiry close"): relays frames between the network and the
/// bridge until either side closes, then feeds exactly one
/// `websocket.disconnect`.
pub async fn drive_websocket_cycle<S>(
    mut ws: WebSocketStream<S>,
    feed: ReceiveFeed,
    mut sink: SendSink,
    config: &ServerConfig,
    cancellation: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut last_incoming = tokio::time::Instant::now();
    let max_age_deadline = config.websocket_max_age.map(|age| tokio::time::Instant::now() + age);
    let mut ping_interval = tokio::time::interval(config.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ping_count: u64 = 0;

    let disconnect_code = loop {
        let ping_timeout_deadline = last_incoming + config.ping_timeout;

        tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                send_close(&mut ws, 1001).await;
                break 1001;
            }

            _ = sleep_until_option(max_age_deadline) => {
                send_close(&mut ws, 1000).await;
                break 1000;
            }

            _ = tokio::time::sleep_until(ping_timeout_deadline) => {
                send_close(&mut ws, 1011).await;
                break 1011;
            }

            _ = ping_interval.tick() => {
                ping_count += 1;
                if ws.send(ts::Message::Ping(ping_count.to_be_bytes().to_vec())).await.is_err() {
                    break ABNORMAL_CLOSURE;
                }
            }

            incoming = ws.next() => {
                match incoming {
                    Some(Ok(ts::Message::Text(text))) => {
                        last_incoming = tokio::time::Instant::now();
                        ping_interval.reset();
                        if feed
                            .feed(ReceiveEvent::WebSocketReceive(WebSocketMessage::Text(text.as_str().to_string())))
                            .await
                            .is_err()
                        {
                            break ABNORMAL_CLOSURE;
                        }
                    }
                    Some(Ok(ts::Message::Binary(data))) => {
                        last_incoming = tokio::time::Instant::now();
                        ping_interval.reset();
                        if feed
                            .feed(ReceiveEvent::WebSocketReceive(WebSocketMessage::Bytes(data.into())))
                            .await
                            .is_err()
                        {
                            break ABNORMAL_CLOSURE;
                        }
                    }
                    Some(Ok(ts::Message::Ping(_) | ts::Message::Pong(_))) => {
                        // tungstenite answers pings automatically and we
                        // don't need pongs for anything but the liveness
                        // signal already recorded above.
                        last_incoming = tokio::time::Instant::now();
                        ping_interval.reset();
                    }
                    Some(Ok(ts::Message::Close(frame))) => {
                        break frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                    }
                    Some(Ok(ts::Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        break if matches!(e, TungsteniteError::Capacity(_)) { 1009 } else { ABNORMAL_CLOSURE };
                    }
                    None => break ABNORMAL_CLOSURE,
                }
            }

            outgoing = sink.next() => {
                match outgoing {
                    Some(SendEvent::WebSocketSend(WebSocketMessage::Text(text))) => {
                        if ws.send(ts::Message::Text(text.into())).await.is_err() {
                            break ABNORMAL_CLOSURE;
                        }
                    }
                    Some(SendEvent::WebSocketSend(WebSocketMessage::Bytes(data))) => {
                        if ws.send(ts::Message::Binary(data.to_vec())).await.is_err() {
                            break ABNORMAL_CLOSURE;
                        }
                    }
                    Some(SendEvent::WebSocketClose { code }) => {
                        send_close(&mut ws, code).await;
                        break code;
                    }
                    Some(_) => {
                        tracing::error!("application sent an out-of-order event on an open websocket");
                    }
                    None => {
                        // Application finished without an explicit close;
                        // close normally rather than leaving the socket open.
                        send_close(&mut ws, 1000).await;
                        break 1000;
                    }
                }
            }
        }
    };

    let _ = feed.feed(ReceiveEvent::WebSocketDisconnect { code: disconnect_code }).await;
}

async fn send_close<S>(ws: &mut WebSocketStream<S>, code: u16)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let _ = ws
        .send(ts::Message::Close(Some(CloseFrame {
            code: code.into(),
            reason: std::borrow::Cow::Borrowed(""),
        })))
        .await;
}

async fn sleep_until_option(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abnormal_closure_matches_rfc6455() {
        assert_eq!(ABNORMAL_CLOSURE, 1006);
    }

    #[tokio::test]
    async fn ping_payload_is_monotonic_and_cadence_resets_on_incoming_activity() {
        let config = Arc::new(ServerConfig {
            ping_interval: std::time::Duration::from_millis(50),
            ping_timeout: std::time::Duration::from_secs(5),
            ..ServerConfig::default()
        });

        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = WebSocketStream::from_raw_socket(client_io, ts::protocol::Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, ts::protocol::Role::Server, None).await;

        let (_receiver, feed, _sender, sink) = new_bridge(ReceiveEvent::WebSocketDisconnect {
            code: ABNORMAL_CLOSURE,
        });
        let cancellation = CancellationToken::new();
        let driver_config = config.clone();
        let driver = tokio::spawn(async move {
            drive_websocket_cycle(server, feed, sink, &driver_config, cancellation).await;
        });

        let first = client.next().await.unwrap().unwrap();
        let first_payload = match first {
            ts::Message::Ping(payload) => payload,
            other => panic!("expected a ping, got {other:?}"),
        };
        assert_eq!(first_payload.as_ref(), 1u64.to_be_bytes());

        // Send activity well before the next ping is due; it should push
        // the next ping back by a full interval instead of firing on the
        // original fixed schedule.
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        client.send(ts::Message::Text("hi".into())).await.unwrap();

        let second = client.next().await.unwrap().unwrap();
        let second_payload = match second {
            ts::Message::Ping(payload) => payload,
            other => panic!("expected a ping, got {other:?}"),
        };
        assert_eq!(second_payload.as_ref(), 2u64.to_be_bytes());

        driver.abort();
    }
}

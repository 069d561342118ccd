// =============================================================================
// Hub Session — writer/reader workers for one WebSocket subscriber
// =============================================================================
//
// The writer drains the session queue onto the wire under a write deadline,
// coalescing whatever is already queued into one flush to keep syscalls
// down at high fan-out rates. The reader consumes keepalive traffic and
// bounds peer-sent bytes. Protocol keepalive: a ping goes out every 9/10
// of the pong window; the peer-liveness deadline is absolute and advances
// only when an inbound frame arrives, so a half-open socket that still
// accepts local writes is evicted once the window lapses.
//
// Whichever side breaks the loop, the session unregisters exactly once.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

use crate::hub::{Hub, SessionQueue};

/// The peer must show life within this window.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for any single write batch.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Peers only send keepalives; anything bigger is abuse.
const MAX_PEER_MESSAGE_BYTES: usize = 1024;
/// Upper bound on messages coalesced into one flush.
const COALESCE_LIMIT: usize = 32;

/// Drive one subscriber connection until either side closes.
pub async fn run_session(socket: WebSocket, hub: Arc<Hub>) {
    run_session_inner(socket, hub).await;
}

/// Generic over the socket so tests can drive the loop with a scripted
/// transport on the paused clock.
async fn run_session_inner<S>(socket: S, hub: Arc<Hub>)
where
    S: Stream<Item = Result<Message, axum::Error>> + Sink<Message, Error = axum::Error> + Unpin,
{
    let Some(mut session) = hub.register() else {
        // Hub is stopping; refuse politely.
        let mut socket = socket;
        let _ = socket.close().await;
        return;
    };
    let session_id = session.id;
    let (mut sink, mut stream) = socket.split();

    let mut ping_interval = tokio::time::interval(PONG_TIMEOUT * 9 / 10);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it.
    ping_interval.tick().await;

    // Absolute liveness deadline. Only inbound frames push it forward;
    // outbound pings succeeding locally must never keep a dead peer alive.
    let mut read_deadline = Instant::now() + PONG_TIMEOUT;

    loop {
        tokio::select! {
            queued = session.rx.recv() => {
                match queued {
                    None => {
                        debug!(session_id, "session queue closed — hub side shutdown");
                        break;
                    }
                    Some(payload) => {
                        if write_batch(&mut sink, &mut session, payload).await.is_err() {
                            debug!(session_id, "write failed — closing session");
                            break;
                        }
                    }
                }
            }

            _ = ping_interval.tick() => {
                let ping = sink.send(Message::Ping(Vec::new()));
                match timeout(WRITE_DEADLINE, ping).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(session_id, "ping write failed — closing session");
                        break;
                    }
                }
            }

            _ = sleep_until(read_deadline) => {
                warn!(session_id, "peer silent past pong window — closing");
                break;
            }

            incoming = stream.next() => {
                match incoming {
                    None => break,
                    Some(Err(e)) => {
                        debug!(session_id, error = %e, "receive error — closing session");
                        break;
                    }
                    Some(Ok(frame)) => {
                        // Any inbound frame proves the peer is alive.
                        read_deadline = Instant::now() + PONG_TIMEOUT;
                        if !handle_frame(session_id, &mut sink, frame).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    hub.unregister(session_id);
}

/// Write `first` plus anything already queued as a single flushed batch.
async fn write_batch<S>(
    sink: &mut S,
    session: &mut SessionQueue,
    first: Arc<str>,
) -> Result<(), ()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let batch = async {
        sink.feed(Message::Text(first.to_string())).await?;
        let mut sent = 1;
        while sent < COALESCE_LIMIT {
            match session.rx.try_recv() {
                Ok(payload) => {
                    sink.feed(Message::Text(payload.to_string())).await?;
                    sent += 1;
                }
                Err(_) => break,
            }
        }
        sink.flush().await
    };

    match timeout(WRITE_DEADLINE, batch).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

/// Returns false when the session must close.
async fn handle_frame<S>(session_id: u64, sink: &mut S, frame: Message) -> bool
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match frame {
        Message::Pong(_) => true,
        Message::Ping(data) => {
            matches!(timeout(WRITE_DEADLINE, sink.send(Message::Pong(data))).await, Ok(Ok(())))
        }
        Message::Text(text) => {
            if text.len() > MAX_PEER_MESSAGE_BYTES {
                warn!(session_id, bytes = text.len(), "oversized peer text frame — closing");
                return false;
            }
            // Treated as an application-level heartbeat.
            true
        }
        Message::Binary(data) => {
            if data.len() > MAX_PEER_MESSAGE_BYTES {
                warn!(session_id, bytes = data.len(), "oversized peer binary frame — closing");
                return false;
            }
            true
        }
        Message::Close(_) => {
            debug!(session_id, "close frame from peer");
            false
        }
    }
}

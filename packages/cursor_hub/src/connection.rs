//! Connection Lifecycle
//!
//! Each connection runs two loops coupled only through its mailbox and a
//! shared "transport closed" token:
//! - reader: decodes inbound frames, applies cursor updates to the registry,
//!   queues echo/error replies into its own mailbox
//! - writer: drains the mailbox to the wire in order and sends keepalive pings
//!
//! Whichever side stops first brings the other one down. The reader's exit is
//! the single place that asks the coordinator to unregister the connection.

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::HubSettings;
use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::mailbox::{Mailbox, MailboxReceiver, mailbox};
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use crate::registry::{ConnectionHandle, Registry};

/// Drive one connection from registration to removal.
///
/// `stream` and `sink` are the two halves of the transport. Returns once the
/// reader has stopped, the connection has been unregistered and the writer
/// has finished or been aborted.
pub async fn run_connection<S, W>(stream: S, sink: W, hub: &Hub) -> ConnectionId
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display,
{
    let id = ConnectionId::new();
    let settings = hub.settings().clone();

    let (mailbox_tx, mailbox_rx) = mailbox(settings.mailbox_capacity);
    let handle = ConnectionHandle::new(id, mailbox_tx.clone());

    if let Err(e) = hub.coordinator().register(handle).await {
        error!(conn_id = %id, code = e.error_code(), error = %e, "Failed to register connection");
        return id;
    }
    debug!(conn_id = %id, "Connection active");

    let transport_closed = CancellationToken::new();
    let mut writer = tokio::spawn(writer_loop(
        sink,
        mailbox_rx,
        settings.clone(),
        transport_closed.clone(),
        id,
    ));

    let outcome = reader_loop(
        stream,
        hub.registry(),
        &mailbox_tx,
        &settings,
        &transport_closed,
        id,
    )
    .await;

    match &outcome {
        Ok(()) => info!(conn_id = %id, "Connection closed"),
        Err(e @ HubError::IdleTimeout(_)) => {
            info!(conn_id = %id, code = e.error_code(), "Connection idle, closing")
        }
        Err(e) if e.is_terminal() => {
            warn!(conn_id = %id, code = e.error_code(), error = %e, "Connection failed")
        }
        Err(e) => debug!(conn_id = %id, code = e.error_code(), error = %e, "Reader stopped"),
    }

    // Removal closes the mailbox, which is the writer's normal stop signal.
    hub.coordinator().unregister(id).await;
    drop(mailbox_tx);

    // Grace period for the drain, then one more for the in-flight write and
    // the close frame once the writer has seen the cancel.
    if timeout(settings.write_timeout, &mut writer).await.is_err() {
        debug!(conn_id = %id, "Writer still draining, closing transport");
        transport_closed.cancel();
        if timeout(settings.write_timeout, &mut writer).await.is_err() {
            warn!(conn_id = %id, "Writer did not stop, aborting");
            writer.abort();
        }
    }
    transport_closed.cancel();

    debug!(conn_id = %id, "Connection finished");
    id
}

/// Read frames until the peer goes away, the transport fails, nothing arrives
/// for `read_timeout`, or the writer stops.
///
/// `Ok(())` means an orderly end (close frame, end of stream, writer stopped).
pub async fn reader_loop<S>(
    mut stream: S,
    registry: &Registry,
    mailbox: &Mailbox,
    settings: &HubSettings,
    transport_closed: &CancellationToken,
    id: ConnectionId,
) -> HubResult<()>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = transport_closed.cancelled() => {
                debug!(conn_id = %id, "Writer stopped, ending reader");
                return Ok(());
            }
            next = timeout(settings.read_timeout, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => return Err(HubError::IdleTimeout(settings.read_timeout)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(HubError::transport(e)),
            Ok(Some(Ok(msg))) => msg,
        };

        let reply = match &msg {
            Message::Text(text) => {
                debug!(conn_id = %id, "Received: {}", text.as_str());
                handle_frame(text.as_str().as_bytes(), registry, id).await
            }
            Message::Binary(data) => handle_frame(data, registry, id).await,
            // Any frame, keepalive included, already reset the idle timer.
            Message::Ping(_) | Message::Pong(_) => None,
            Message::Close(frame) => {
                info!(conn_id = %id, reason = ?frame, "Client initiated close");
                return Ok(());
            }
        };

        if let Some(reply) = reply {
            tokio::select! {
                biased;
                _ = transport_closed.cancelled() => return Ok(()),
                queued = mailbox.send(reply) => {
                    if !queued {
                        debug!(conn_id = %id, "Mailbox closed, reply dropped");
                    }
                }
            }
        }
    }
}

/// Apply one inbound frame. Returns the reply to queue for the sender, if any.
pub async fn handle_frame(
    frame: &[u8],
    registry: &Registry,
    id: ConnectionId,
) -> Option<ServerMessage> {
    match ClientMessage::decode(frame) {
        Ok(ClientMessage::Echo(data)) => Some(ServerMessage::Echo(data)),
        Ok(ClientMessage::UpdatePos(state)) => {
            debug!(conn_id = %id, cursor = ?state, "Updated cursor");
            registry.update(&id, state).await;
            None
        }
        Ok(ClientMessage::Unknown(action)) => {
            debug!(conn_id = %id, action = %action, "Unknown action");
            None
        }
        Err(e @ HubError::Validation { .. }) => {
            warn!(conn_id = %id, code = e.error_code(), error = %e, "Dropping invalid payload");
            None
        }
        Err(e) => {
            warn!(conn_id = %id, code = e.error_code(), error = %e, "Error parsing message");
            Some(ServerMessage::invalid_format())
        }
    }
}

/// Drain the mailbox to the wire and keep the peer alive with pings.
///
/// Stops when the mailbox is closed and empty (sending a close frame), when
/// `transport_closed` fires (even with messages still queued), or on the
/// first failed or overdue write. On exit `transport_closed` is cancelled so
/// the reader stops too.
pub async fn writer_loop<W>(
    mut sink: W,
    mut mailbox: MailboxReceiver,
    settings: HubSettings,
    transport_closed: CancellationToken,
    id: ConnectionId,
) -> HubResult<()>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let _closed_on_exit = transport_closed.clone().drop_guard();
    let write_timeout = settings.write_timeout;

    let mut ping = interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            biased;
            msg = mailbox.recv() => match msg {
                Some(_) if transport_closed.is_cancelled() => {
                    debug!(conn_id = %id, "Transport closed, abandoning queued messages");
                    let _ = send_frame(&mut sink, Message::Close(None), write_timeout).await;
                    break Ok(());
                }
                Some(msg) => {
                    let text = match msg.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(conn_id = %id, error = %e, "Failed to serialize message");
                            continue;
                        }
                    };
                    trace!(conn_id = %id, action = msg.action(), "Sending");
                    if let Err(e) = send_frame(&mut sink, Message::Text(text.into()), write_timeout).await {
                        break Err(e);
                    }
                }
                None => {
                    let _ = send_frame(&mut sink, Message::Close(None), write_timeout).await;
                    break Ok(());
                }
            },
            _ = transport_closed.cancelled() => {
                let _ = send_frame(&mut sink, Message::Close(None), write_timeout).await;
                break Ok(());
            }
            _ = ping.tick() => {
                if let Err(e) = send_frame(&mut sink, Message::Ping(Default::default()), write_timeout).await {
                    break Err(e);
                }
            }
        }
    };

    if let Err(e) = &result {
        warn!(conn_id = %id, code = e.error_code(), error = %e, "Error writing message");
    }
    result
}

async fn send_frame<W>(sink: &mut W, msg: Message, deadline: Duration) -> HubResult<()>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    match timeout(deadline, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HubError::transport(e)),
        Err(_) => Err(HubError::WriteTimeout(deadline)),
    }
}

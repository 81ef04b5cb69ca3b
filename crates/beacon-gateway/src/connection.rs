use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use beacon_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::{DeliveryOutcome, Dispatcher};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection: Identify handshake, backlog flush
/// via registration, then the event loop until either side goes away.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Step 3: Register with the dispatcher. Subscribe to broadcasts first so
    // the roster snapshot our own registration triggers is not missed; any
    // backlog flush lands in the per-connection queue before the loop below
    // starts draining it.
    let session_id = Uuid::new_v4();
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let mut broadcast_rx = dispatcher.subscribe();

    if let Err(e) = dispatcher
        .on_register(user_id, session_id, conn_tx.clone())
        .await
    {
        // The handle is registered even when the flush failed; undelivered
        // records stay pending and are retried on the next reconnect.
        warn!("Backlog flush failed for {} ({}): {}", username, user_id, e);
    }

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Spawn task to forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} messages", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if sender
                        .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                result = conn_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };

                    if sender
                        .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let username_recv = username.clone();
    let reply_tx = conn_tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, user_id, &username_recv, &reply_tx, cmd)
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.on_disconnect(user_id, session_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use beacon_types::api::Claims;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

/// Client-originated events. All of these bypass persistence: typing and
/// call signaling have no durable value, so an offline target means drop
/// (and, for the call setup pair, a PeerOffline reply to the caller).
async fn handle_command(
    dispatcher: &Dispatcher,
    user_id: Uuid,
    username: &str,
    reply: &mpsc::UnboundedSender<GatewayEvent>,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::StartTyping { recipient_id } => {
            let _ = dispatcher
                .deliver(
                    recipient_id,
                    GatewayEvent::TypingStart {
                        from_user_id: user_id,
                        username: username.to_string(),
                    },
                    None,
                )
                .await;
        }

        GatewayCommand::CallStart { to, offer } => {
            info!("{} ({}) -> call offer to {}", username, user_id, to);
            relay_signal(
                dispatcher,
                to,
                GatewayEvent::CallOffer {
                    from_user_id: user_id,
                    offer,
                },
                Some(reply),
            )
            .await;
        }

        GatewayCommand::CallAnswer { to, answer } => {
            info!("{} ({}) -> call answer to {}", username, user_id, to);
            relay_signal(
                dispatcher,
                to,
                GatewayEvent::CallAnswer {
                    from_user_id: user_id,
                    answer,
                },
                Some(reply),
            )
            .await;
        }

        GatewayCommand::CallCandidate { to, candidate } => {
            relay_signal(
                dispatcher,
                to,
                GatewayEvent::CallCandidate {
                    from_user_id: user_id,
                    candidate,
                },
                None,
            )
            .await;
        }

        GatewayCommand::CallHangUp { to } => {
            relay_signal(
                dispatcher,
                to,
                GatewayEvent::CallHangUp {
                    from_user_id: user_id,
                },
                None,
            )
            .await;
        }
    }
}

/// Relay a signaling event. When `reply` is given and the target has no
/// live connection, the sender is told so (call setup needs the feedback;
/// candidates and hang-ups don't).
async fn relay_signal(
    dispatcher: &Dispatcher,
    to: Uuid,
    event: GatewayEvent,
    reply: Option<&mpsc::UnboundedSender<GatewayEvent>>,
) {
    match dispatcher.deliver(to, event, None).await {
        Ok(DeliveryOutcome::Dropped) => {
            if let Some(reply) = reply {
                let _ = reply.send(GatewayEvent::PeerOffline { user_id: to });
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Signal relay to {} failed: {}", to, e),
    }
}

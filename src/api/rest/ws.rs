use std::future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::assignment::{resolution_payload, resolve_offer, Decision};
use crate::engine::positions::record_rider_location;
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::envelope::{
    classify_text, events, Envelope, Inbound, OfferDecisionPayload,
};
use crate::models::location::LocationSample;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
) -> Result<impl IntoResponse, AppError> {
    let token = params
        .token
        .ok_or_else(|| AppError::Unauthorized("missing token query parameter".to_string()))?;
    let actor = token
        .parse::<Actor>()
        .map_err(|err| AppError::Unauthorized(err.to_string()))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, actor)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, actor: Actor) {
    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Envelope>();

    let mut events = Box::pin(
        BroadcastStream::new(state.events_tx.subscribe()).filter_map(move |item| {
            future::ready(match item {
                Ok(outbound) if outbound.is_for(&actor) => Some(outbound.envelope),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(
                        role = %actor.role,
                        id = %actor.id,
                        skipped,
                        "device session lagging behind events"
                    );
                    None
                }
            })
        }),
    );

    state.metrics.ws_sessions.inc();
    info!(role = %actor.role, id = %actor.id, "device session opened");

    let mut send_task = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                Some(envelope) = events.next() => envelope,
                Some(envelope) = reply_rx.recv() => envelope,
                else => break,
            };

            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(err) => {
                    warn!(
                        error = %err,
                        event = %envelope.kind,
                        "failed to serialize envelope for ws"
                    );
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => handle_text(&recv_state, &actor, &reply_tx, &text),
                Message::Binary(_) => debug!("binary frame ignored"),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.metrics.ws_sessions.dec();
    info!(role = %actor.role, id = %actor.id, "device session closed");
}

fn handle_text(
    state: &AppState,
    actor: &Actor,
    replies: &mpsc::UnboundedSender<Envelope>,
    text: &str,
) {
    let envelope = match classify_text(text) {
        Inbound::Envelope(envelope) => envelope,
        Inbound::Ignored(reason) => {
            debug!(?reason, "inbound frame ignored");
            return;
        }
    };

    match envelope.kind.as_str() {
        events::PING => {
            let _ = replies.send(Envelope::pong());
        }
        events::RIDER_LOCATION_UPDATE => match envelope.payload::<LocationSample>() {
            Ok(sample) => {
                if let Err(err) = record_rider_location(state, actor, actor.id, sample) {
                    warn!(id = %actor.id, error = %err, "location update refused");
                }
            }
            Err(err) => warn!(error = %err, "malformed location update"),
        },
        events::ASSIGNMENT_ACCEPT | events::ASSIGNMENT_REJECT => {
            let decision = if envelope.kind == events::ASSIGNMENT_ACCEPT {
                Decision::Accept
            } else {
                Decision::Reject
            };

            let payload = match envelope.payload::<OfferDecisionPayload>() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "malformed offer decision");
                    return;
                }
            };

            if let Err(err) = resolve_offer(state, actor, payload.order_id, decision) {
                warn!(order_id = %payload.order_id, error = %err, "offer decision refused");
                reply_with_current_offer(state, actor, replies, payload.order_id, err);
            }
        }
        events::CHAT_MESSAGE
        | events::CHAT_TYPING_START
        | events::CHAT_TYPING_STOP
        | events::CHAT_JOIN_ROOM
        | events::CHAT_LEAVE_ROOM => {
            debug!(event = %envelope.kind, "chat event not handled by this service");
        }
        other => debug!(event = other, "unhandled inbound event"),
    }
}

/// Tells the rider the authoritative state of an offer its decision lost on.
fn reply_with_current_offer(
    state: &AppState,
    actor: &Actor,
    replies: &mpsc::UnboundedSender<Envelope>,
    order_id: Uuid,
    err: AppError,
) {
    let offer = state
        .offers
        .get(&order_id)
        .and_then(|ledger| ledger.current().cloned())
        .filter(|offer| offer.rider_id == actor.id);

    let Some(offer) = offer else {
        return;
    };

    match Envelope::new(
        events::ASSIGNMENT_RESOLVED,
        &resolution_payload(&offer, Some(err.to_string())),
    ) {
        Ok(envelope) => {
            let _ = replies.send(envelope);
        }
        Err(err) => warn!(error = %err, "failed to encode offer state"),
    }
}

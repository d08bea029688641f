//! WebSocket event stream.
//!
//! A connected client becomes a channel-backed observer for as long as the
//! socket stays open. Envelopes are sent as JSON text frames.
//!
//! A client reconnecting under an id that is still connected takes the
//! registration over; the older socket is closed once its queue drains.

use std::sync::{Arc, Weak};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::admin::AdminState;
use crate::events::{ChannelObserver, EventKind, EventMask, EventObserver};
use crate::service::EngineService;

#[derive(Debug, Deserialize)]
pub struct ObserveParams {
    /// Registration id; generated when absent.
    pub id: Option<String>,
    /// Comma separated pollable kinds, e.g. `traffic,log`.
    pub kinds: Option<String>,
}

pub async fn observe(
    State(state): State<AdminState>,
    Query(params): Query<ObserveParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let mask = match parse_kinds(params.kinds.as_deref()) {
        Ok(mask) => mask,
        Err(kind) => return (StatusCode::BAD_REQUEST, format!("unknown event kind '{kind}'")).into_response(),
    };
    let id = params
        .id
        .unwrap_or_else(|| format!("ws-{}", uuid::Uuid::new_v4()));

    ws.on_upgrade(move |socket| stream_events(socket, state.service, id, mask))
}

fn parse_kinds(kinds: Option<&str>) -> Result<EventMask, String> {
    let Some(kinds) = kinds else {
        return Ok(EventMask::EMPTY);
    };
    kinds
        .split(',')
        .filter(|kind| !kind.trim().is_empty())
        .map(|kind| kind.parse::<EventKind>().map_err(|_| kind.trim().to_string()))
        .collect()
}

async fn stream_events(socket: WebSocket, service: Arc<EngineService>, id: String, mask: EventMask) {
    let (observer, mut events) = ChannelObserver::new(service.registry().queue_capacity());
    let observer: Arc<dyn EventObserver> = Arc::new(observer);
    // the registry owns the observer; a takeover under the same id drops it
    let registered: Weak<dyn EventObserver> = Arc::downgrade(&observer);
    service.register_observer(id.clone(), mask, observer);
    tracing::info!(observer = %id, mask = ?mask, "WebSocket observer connected");

    let mut shutdown = service.subscribe_shutdown();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!(observer = %id, "WebSocket observer superseded");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(event.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(observer = %id, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    if let Some(observer) = registered.upgrade() {
        service.unregister_observer_if(&id, &observer);
    }
    tracing::info!(observer = %id, "WebSocket observer disconnected");
}

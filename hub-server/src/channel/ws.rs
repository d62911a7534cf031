//! WebSocket transport for peer duplex channels.
//!
//! A peer opens `GET /v1/channel/:peer_id` after registering, presenting the
//! channel token from its registration as `Authorization: Bearer <token>` or
//! `?token=<token>`. Frames are JSON text until the peer sends its first
//! binary frame; from then on the coordinator answers in MessagePack as well.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hub_types::{ChannelMessage, PeerId, WireError};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::QueueChannel;
use crate::error::{HubError, RegistryError};
use crate::http::ApiError;
use crate::relay::RelayCoordinator;
use crate::server::CoordinatorState;

/// Outbound messages buffered per peer before sends fail as backed up.
const OUTBOUND_QUEUE: usize = 256;

/// Query form of the channel token, for clients that cannot set headers.
#[derive(Debug, Default, Deserialize)]
pub struct ChannelAuth {
    /// Channel token issued at registration.
    pub token: Option<String>,
}

/// Upgrade a registered peer's request to its duplex channel.
///
/// The token is checked before the upgrade headers.
pub async fn channel_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(peer_id): Path<String>,
    Query(auth): Query<ChannelAuth>,
    headers: HeaderMap,
    Extension(state): Extension<Arc<CoordinatorState>>,
) -> Result<Response, ApiError> {
    let peer_id = PeerId::new(peer_id).map_err(HubError::from)?;
    let token = bearer_token(&headers)
        .or(auth.token.as_deref())
        .ok_or(RegistryError::ChannelUnauthorized)?;
    state.registry().verify_channel_token(&peer_id, token)?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| run_channel(socket, peer_id, state)))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn run_channel(socket: WebSocket, peer_id: PeerId, state: Arc<CoordinatorState>) {
    let (sender, mut receiver) = socket.split();
    let (channel, outbound) = QueueChannel::pair(peer_id.clone(), OUTBOUND_QUEUE);
    let binary = Arc::new(AtomicBool::new(false));

    let writer = tokio::spawn(write_frames(
        sender,
        outbound,
        binary.clone(),
        peer_id.clone(),
    ));

    let connection = state.channels().attach(peer_id.clone(), Arc::new(channel));
    state
        .metrics()
        .channels_opened_total
        .fetch_add(1, Ordering::Relaxed);

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(state.relay(), &peer_id, Frame::Text(&text)).await,
            Ok(Message::Binary(bytes)) => {
                binary.store(true, Ordering::Relaxed);
                dispatch(state.relay(), &peer_id, Frame::Binary(&bytes)).await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                tracing::debug!(peer = %peer_id, "close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %peer_id, error = %e, "channel receive error");
                break;
            }
        }
    }

    // A newer connection may already have replaced this one.
    if state.channels().detach(&peer_id, connection) {
        state.relay().on_channel_closed(&peer_id);
    }
    writer.abort();
    tracing::info!(peer = %peer_id, connection, "channel closed");
}

/// An inbound data frame.
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    /// JSON text.
    Text(&'a str),
    /// MessagePack.
    Binary(&'a [u8]),
}

/// Decode a frame from `from` and hand it to the relay coordinator.
///
/// A frame that does not decode still fails the relay it answers when its
/// `request_id` can be read.
pub async fn dispatch(relay: &RelayCoordinator, from: &PeerId, frame: Frame<'_>) {
    let decoded = match frame {
        Frame::Text(text) => ChannelMessage::from_json(text)
            .map_err(|e| (e, ChannelMessage::peek_request_id_json(text))),
        Frame::Binary(bytes) => ChannelMessage::from_bytes(bytes)
            .map_err(|e| (e, ChannelMessage::peek_request_id_bytes(bytes))),
    };
    match decoded {
        Ok(message) => relay.on_message(from, message).await,
        Err((e, request_id)) => {
            relay.on_undecodable(from, request_id, e.to_string());
        }
    }
}

async fn write_frames(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ChannelMessage>,
    binary: Arc<AtomicBool>,
    peer_id: PeerId,
) {
    while let Some(message) = outbound.recv().await {
        let frame = match encode(&message, binary.load(Ordering::Relaxed)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = %peer_id, error = %e, "outbound message not encodable");
                continue;
            }
        };
        if let Err(e) = sender.send(frame).await {
            tracing::debug!(peer = %peer_id, error = %e, "channel send failed");
            break;
        }
    }
    let _ = sender.close().await;
}

fn encode(message: &ChannelMessage, binary: bool) -> Result<Message, WireError> {
    if binary {
        Ok(Message::Binary(message.to_bytes()?))
    } else {
        Ok(Message::Text(message.to_json()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_types::RequestId;

    #[test]
    fn bearer_header_wins_over_nothing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer 0f0f".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("0f0f"));
    }

    #[test]
    fn text_until_binary() {
        let message = ChannelMessage::Deliver {
            request_id: RequestId::new(),
            content_id: hub_types::ContentId::new("store1").unwrap(),
            range: None,
        };

        match encode(&message, false).unwrap() {
            Message::Text(text) => {
                assert_eq!(ChannelMessage::from_json(&text).unwrap(), message);
                assert!(text.contains("\"type\":\"deliver\""));
            }
            other => panic!("expected text frame, got {other:?}"),
        }
        match encode(&message, true).unwrap() {
            Message::Binary(bytes) => assert_eq!(ChannelMessage::from_bytes(&bytes).unwrap(), message),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}

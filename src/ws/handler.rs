//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::game::player::DEFAULT_PLAYER_NAME;
use crate::game::{RoomHandle, Uid};
use crate::http::AppError;
use crate::util::time::unix_millis;
use crate::ws::connection::{serve, Outbound, TransportSettings};
use crate::ws::protocol::{GamePacket, SnapshotPacket};

/// Longest accepted room id
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub room_id: Option<String>,
    /// Room token issued by match-making
    pub token: Option<String>,
    pub uid: Option<String>,
}

/// Validated connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub room_id: String,
    pub token: String,
    pub uid: Uid,
}

impl WsQuery {
    pub fn validate(self) -> Result<ConnectParams, AppError> {
        let room_id = self.room_id.unwrap_or_default();
        let token = self.token.unwrap_or_default();
        if room_id.is_empty() || token.is_empty() {
            return Err(AppError::BadRequest("room_id and token required".to_string()));
        }
        if !is_valid_room_id(&room_id) {
            return Err(AppError::BadRequest("invalid room_id".to_string()));
        }

        let uid = match self.uid.as_deref().map(str::trim) {
            None | Some("") => return Err(AppError::BadRequest("uid required".to_string())),
            Some(raw) => raw
                .parse::<Uid>()
                .map_err(|_| AppError::BadRequest("invalid uid".to_string()))?,
        };

        Ok(ConnectParams {
            room_id,
            token,
            uid,
        })
    }
}

/// Room ids are short and limited to `[A-Za-z0-9_-]`
pub fn is_valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// WebSocket upgrade handler. Parameters and the room token are checked
/// before the upgrade is accepted.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let params = match query.validate() {
        Ok(params) => params,
        Err(e) => return e.into_response(),
    };

    match state.tokens.validate(&params.room_id, &params.token).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(room_id = %params.room_id, uid = params.uid, "Invalid room token");
            return AppError::Forbidden("invalid room token".to_string()).into_response();
        }
        Err(e) => {
            error!(room_id = %params.room_id, error = %e, "Token store lookup failed");
            return AppError::Internal("internal error".to_string()).into_response();
        }
    }

    let Some(ws) = ws else {
        return AppError::UpgradeRequired.into_response();
    };

    info!(room_id = %params.room_id, uid = params.uid, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, params: ConnectParams, state: AppState) {
    let ConnectParams { room_id, uid, .. } = params;
    let settings = TransportSettings::default();
    let (outbound, rx) = Outbound::channel(uid, settings.outbound_capacity);
    let connection = outbound.id();

    // Empty tick-0 snapshot confirms the connection to the client
    outbound.send(&GamePacket::Snapshot(SnapshotPacket {
        server_time: unix_millis(),
        tick: 0,
        players: Vec::new(),
        beams: Vec::new(),
    }));

    let Some(room) = join_room(&state, &room_id, uid, outbound).await else {
        warn!(room_id = %room_id, uid, "Could not join room");
        return;
    };

    let (sink, stream) = socket.split();
    serve(connection, uid, sink, stream, rx, room, settings).await;
}

/// Register the player, retrying once if the room closed between lookup
/// and join
pub async fn join_room(
    state: &AppState,
    room_id: &str,
    uid: Uid,
    outbound: Outbound,
) -> Option<RoomHandle> {
    for _ in 0..2 {
        let room = state.registry.create(room_id);
        if room
            .join(uid, DEFAULT_PLAYER_NAME.to_string(), outbound.clone())
            .await
            .is_ok()
        {
            return Some(room);
        }
    }
    None
}

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde::Deserialize;
use tokio::task::JoinHandle;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use crate::config::ServerConfig;
use crate::connections::ConnectionHandle;
use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::messages::ServerMessage;

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

pub struct Server {
    coordinator: Arc<Coordinator>,
    config: ServerConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    session_id: String,
    host_user_id: String,
}

impl Server {
    pub fn new(coordinator: Arc<Coordinator>, config: ServerConfig) -> Self {
        Server {
            coordinator,
            config,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Periodically closes connections that have gone quiet. `None` when reaping is disabled.
    pub fn spawn_reaper(&self) -> Option<JoinHandle<()>> {
        let idle_timeout = self.config.idle_timeout;
        if idle_timeout.is_zero() {
            return None;
        }
        let connections = Arc::clone(self.coordinator.connections());

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval((idle_timeout / 2).max(MIN_REAP_INTERVAL));
            loop {
                ticker.tick().await;
                for connection_id in connections.idle_connections(idle_timeout).await {
                    info!("Reaping idle connection {}", connection_id);
                    connections.close(&connection_id).await;
                }
            }
        }))
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let ConnectionHandle {
            id,
            mut outbound,
            close,
        } = self.coordinator.connections().register().await;
        info!("New WebSocket connection: {}", id);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let ping_interval = self.config.ping_interval;

        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    message = outbound.recv() => {
                        let Some(text) = message else { break };
                        if let Err(e) = ws_tx.send(Message::text(text)).await {
                            warn!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if ws_tx.send(Message::ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_tx.close().await;
        });

        loop {
            tokio::select! {
                frame = ws_rx.next() => match frame {
                    Some(Ok(msg)) => {
                        self.coordinator.connections().touch(&id).await;
                        if msg.is_close() {
                            break;
                        }
                        if let Ok(text) = msg.to_str() {
                            self.coordinator.handle_text(&id, text).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                    None => break,
                },
                () = close.notified() => break,
            }
        }

        self.coordinator.disconnect(&id).await;
        // Unregistering dropped the outbound sender, so the writer drains and exits.
        let _ = writer.await;
        info!("WebSocket connection {} closed", id);
    }
}

pub fn routes(
    server: Arc<Server>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let static_dir = server.config.static_dir.clone();
    let with_server = warp::any().map(move || Arc::clone(&server));

    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_server.clone())
        .map(|ws: warp::ws::Ws, server: Arc<Server>| {
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let create_room = warp::path("rooms")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server.clone())
        .and_then(create_room_handler);

    let get_room = warp::path!("rooms" / String)
        .and(warp::get())
        .and(with_server.clone())
        .and_then(get_room_handler);

    let failed_credits = warp::path!("credits" / "failed")
        .and(warp::get())
        .and(with_server)
        .and_then(failed_credits_handler);

    let static_files = warp::fs::dir(static_dir);

    ws_route
        .or(create_room)
        .or(get_room)
        .or(failed_credits)
        .or(static_files)
        .with(warp::cors().allow_any_origin())
}

async fn create_room_handler(
    request: CreateRoomRequest,
    server: Arc<Server>,
) -> Result<Response, Infallible> {
    match server
        .coordinator
        .create_room(&request.session_id, &request.host_user_id)
        .await
    {
        Ok(room) => Ok(warp::reply::json(&room).into_response()),
        Err(e) => Ok(error_response(&e)),
    }
}

async fn get_room_handler(room_id: String, server: Arc<Server>) -> Result<Response, Infallible> {
    match server.coordinator.get_room(&room_id).await {
        Some(room) => Ok(warp::reply::json(&room).into_response()),
        None => Ok(error_response(&CoordinatorError::RoomNotFound(room_id))),
    }
}

async fn failed_credits_handler(server: Arc<Server>) -> Result<Response, Infallible> {
    let failed = server.coordinator.failed_credits().await;
    Ok(warp::reply::json(&failed).into_response())
}

fn error_response(error: &CoordinatorError) -> Response {
    let status = match error {
        CoordinatorError::RoomNotFound(_)
        | CoordinatorError::SessionNotFound(_)
        | CoordinatorError::ParticipantNotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::SessionEnded(_) | CoordinatorError::RoomFull(_) => StatusCode::CONFLICT,
        CoordinatorError::Gateway(_) => StatusCode::BAD_GATEWAY,
        CoordinatorError::Credit(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ServerMessage::Error {
        message: error.to_string(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

//! HTTP surface: `GET /ws/:id` upgrades to a signaling channel for session `id`,
//! `GET /` answers `healthy`.
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use tokio::net::TcpListener;

use crate::{
    channel::Frame,
    error::{ChannelErrorKind, Error},
    orchestrator::MediaOrchestrator,
};

pub fn router(orchestrator: Arc<MediaOrchestrator>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ws/:id", get(ws_handler))
        .with_state(orchestrator)
}

/// Serves [`router`] on `listener` until the server fails.
pub async fn serve(listener: TcpListener, orchestrator: Arc<MediaOrchestrator>) -> Result<(), Error> {
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(orchestrator)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "healthy"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(orchestrator): State<Arc<MediaOrchestrator>>,
) -> Response {
    let max_message_size = orchestrator.config().channel.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, id, orchestrator))
}

async fn handle_socket(socket: WebSocket, id: String, orchestrator: Arc<MediaOrchestrator>) {
    tracing::info!("session={} connected", id);
    let (sink, stream) = socket.split();
    let reader = stream.map(|message| message.map(Frame::from).map_err(Error::from));
    let writer = sink.with(|frame: Frame| future::ready(Ok::<Message, Error>(frame.into())));
    orchestrator.accept(&id, reader, writer).await;
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data.into()),
            Message::Ping(data) => Frame::Ping(data.into()),
            Message::Pong(data) => Frame::Pong(data.into()),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
            Frame::Ping(data) => Message::Ping(data.to_vec()),
            Frame::Pong(data) => Message::Pong(data.to_vec()),
            Frame::Close => Message::Close(None),
        }
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Error::new_channel(err.to_string(), ChannelErrorKind::ConnectionError)
    }
}

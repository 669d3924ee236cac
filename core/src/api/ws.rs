use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::error;
use warp::ws::{Message, WebSocket};

use crate::{
	rpc::{
		dispatcher::{Dispatcher, Disposition, Frame, Sessions},
		registry::Endpoint,
	},
	utils::spawn_in_span,
};

fn to_message(frame: Frame) -> Message {
	match frame {
		Frame::Text(text) => Message::text(text),
		Frame::Close { code, reason } => Message::close_with(code, reason),
	}
}

/// Drives one WebSocket connection through its own dispatcher. Returns when
/// the peer disconnects or the dispatcher decides to close.
pub async fn connect(
	web_socket: WebSocket,
	endpoint: Arc<Endpoint>,
	user: Option<Value>,
	sessions: Sessions,
) {
	let (web_socket_sender, mut web_socket_receiver) = web_socket.split();
	let (sender, receiver) = mpsc::unbounded_channel();
	let receiver_stream =
		UnboundedReceiverStream::new(receiver).map(|frame| Ok(to_message(frame)));

	spawn_in_span(receiver_stream.forward(web_socket_sender).map(|result| {
		if let Err(error) = result {
			error!(%error, event_type = "WS_CONNECT", "Error sending web socket message");
		}
	}));

	let dispatcher = Dispatcher::new(endpoint, user, sender).with_sessions(sessions);
	if dispatcher.open().await == Disposition::Close {
		return;
	}

	while let Some(result) = web_socket_receiver.next().await {
		let message = match result {
			Err(error) => {
				error!(%error, event_type = "WS_CONNECT", "Error receiving client message");
				continue;
			},
			Ok(message) if message.is_close() => break,
			Ok(message) => message,
		};
		let Ok(frame) = message.to_str() else {
			continue;
		};
		if dispatcher.handle_frame(frame.to_string()).await == Disposition::Close {
			break;
		}
	}

	dispatcher.close().await;
}

//! Streamed results: a handler may answer with a lazy sequence of values
//! instead of a single one. The request is answered immediately with the
//! stream identifier, the values follow as `"stream"` notification frames
//! emitted by a background task owned by the connection.

use futures::stream::BoxStream;
use futures::Stream;
use serde_json::{json, Value};
use uuid::Uuid;

use super::envelope::Notification;

pub const STREAM_METHOD: &str = "stream";

pub struct RpcStream {
	pub id: Uuid,
	pub items: BoxStream<'static, Value>,
}

impl RpcStream {
	pub fn new(items: impl Stream<Item = Value> + Send + 'static) -> Self {
		RpcStream {
			id: Uuid::new_v4(),
			items: Box::pin(items),
		}
	}

	/// Immediate `result` of the request that produced this stream.
	pub fn to_result(&self) -> Value {
		json!({ "stream_id": self.id })
	}

	pub fn item_frame(id: Uuid, item: Value) -> Notification {
		Notification::new(STREAM_METHOD, json!({ "stream_id": id, "item": item }))
	}

	/// Terminal frame carrying the number of emitted items.
	pub fn done_frame(id: Uuid, count: usize) -> Notification {
		Notification::new(STREAM_METHOD, json!({ "stream_id": id, "count": count }))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::StreamExt;

	#[tokio::test]
	async fn stream_preserves_item_order() {
		let stream = RpcStream::new(futures::stream::iter(vec![json!(1), json!(2), json!(3)]));
		let items: Vec<Value> = stream.items.collect().await;
		assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
	}

	#[test]
	fn result_carries_stream_id() {
		let stream = RpcStream::new(futures::stream::empty());
		let result = stream.to_result();
		assert_eq!(result["stream_id"], json!(stream.id));
	}

	#[test]
	fn frames_carry_stream_id_and_payload() {
		let id = Uuid::new_v4();
		let frame = RpcStream::item_frame(id, json!("value"));
		assert_eq!(frame.method, STREAM_METHOD);
		assert_eq!(frame.params["stream_id"], json!(id));
		assert_eq!(frame.params["item"], json!("value"));

		let done = RpcStream::done_frame(id, 2);
		assert_eq!(done.params["count"], json!(2));
	}
}

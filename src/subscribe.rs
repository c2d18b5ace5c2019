use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    http::HeaderValue,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use chrono::Utc;
use futures_util::{
    Stream, StreamExt,
    future::ready,
    stream::{self, BoxStream},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{collection::Collection, error::Result};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Update,
    Delete,
}

impl FrameKind {
    fn as_str(self) -> &'static str {
        match self {
            FrameKind::Update => "update",
            FrameKind::Delete => "delete",
        }
    }
}

/// One event-stream record, formatted once per mutation and shared with
/// every subscriber: `event: <kind>\ndata: <json>\nid: <unix_ms>\n\n`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub data: String,
    pub id: i64,
}

impl Frame {
    pub fn update(document_json: String) -> Self {
        Self::update_with_id(document_json, now_ms())
    }

    /// Initial snapshot frames share a single wall-clock id.
    pub fn update_with_id(document_json: String, id: i64) -> Self {
        Self {
            kind: FrameKind::Update,
            data: document_json,
            id,
        }
    }

    /// Delete frames carry the JSON-quoted path of the removed entity.
    pub fn delete(entity_path: &str) -> Result<Self> {
        Ok(Self {
            kind: FrameKind::Delete,
            data: serde_json::to_string(entity_path)?,
            id: now_ms(),
        })
    }

    fn into_event(self) -> Event {
        Event::default()
            .event(self.kind.as_str())
            .data(self.data)
            .id(self.id.to_string())
    }
}

/// A change notification headed for one collection's subscribers. The frame
/// is pre-formatted; `doc_name` is the key the subscriber range-gates on.
#[derive(Debug, Clone)]
pub struct SubMessage {
    pub doc_name: String,
    pub frame: Frame,
}

/// Best-effort fan-out: each subscriber either accepts the message into its
/// bounded queue or misses it. A full queue means the subscriber is too slow
/// and the frame is dropped for that subscriber only; a closed queue means
/// it is tearing down. The producer never blocks.
pub fn notify(collection: &Collection, doc_name: &str, frame: &Frame) {
    let subscribers = collection.snapshot_subscribers();
    if subscribers.is_empty() {
        return;
    }
    info!(
        "notifying {} subscribers in collection {}",
        subscribers.len(),
        collection.name()
    );
    for sender in subscribers {
        let message = SubMessage {
            doc_name: doc_name.to_string(),
            frame: frame.clone(),
        };
        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "dropping frame for slow subscriber of collection {}",
                    collection.name()
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Removes the subscriber from its collection when the response stream is
/// dropped, whether by client disconnect or stream end.
struct SubscriberSlot {
    collection: Arc<Collection>,
    id: u64,
}

impl Drop for SubscriberSlot {
    fn drop(&mut self) {
        debug!(
            "subscriber {} leaving collection {}",
            self.id,
            self.collection.name()
        );
        self.collection.remove_subscriber(self.id);
    }
}

struct SubscriptionStream {
    inner: BoxStream<'static, std::result::Result<Event, Infallible>>,
    _slot: SubscriberSlot,
}

impl Stream for SubscriptionStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

/// Build the streaming response for one subscriber: emit the initial
/// snapshot frames, then join the collection's subscriber set and relay
/// every inbound frame whose document name falls inside `[low, high]`.
/// Idle periods are bridged with `: keep alive` comment frames.
pub fn subscription_response(
    collection: Arc<Collection>,
    low: String,
    high: String,
    initial: Vec<Frame>,
    buffer: usize,
    keep_alive: Duration,
) -> Response {
    let (sender, receiver) = mpsc::channel::<SubMessage>(buffer);
    let id = collection.add_subscriber(sender);
    let slot = SubscriberSlot { collection, id };

    let live = ReceiverStream::new(receiver)
        .filter(move |message| {
            let inside = message.doc_name.as_str() >= low.as_str()
                && message.doc_name.as_str() <= high.as_str();
            ready(inside)
        })
        .map(|message| Ok::<_, Infallible>(message.frame.into_event()));

    let opening = stream::iter(
        initial
            .into_iter()
            .map(|frame| Ok::<_, Infallible>(frame.into_event())),
    );

    let stream = SubscriptionStream {
        inner: opening.chain(live).boxed(),
        _slot: slot,
    };

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive).text("keep alive"))
        .into_response();
    let headers = response.headers_mut();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));
    response
}

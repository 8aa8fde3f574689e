//! `GET /sse/:chat_id` — streams `job.updated`/`ping` events for one chat.
//!
//! Shape follows `kernel/sse.rs`'s `stream_handler` (axum SSE + `KeepAlive`),
//! adapted from a `BroadcastStream` over `StreamHub` to a `futures::stream::unfold`
//! over the per-subscriber `EventBus` subscription, since the bus hands out
//! individual `mpsc` receivers rather than a shared broadcast channel. The 30s
//! idle-ping policy follows `sse.py`'s `asyncio.wait_for(queue.get(), timeout=30.0)`.
//!
//! The channel is keyed by the authenticated `x-user-id`, not the path
//! `chat_id` — the poller publishes to `chat:<job.user_id>` (see
//! `jobs/poller.rs`), and `sse.py:28` likewise ignores the path chat id in
//! favor of the caller's own user id when picking a channel to subscribe to.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream};

use crate::kernel::jobs::events::{Event, Subscription};

use super::super::app::AppState;
use super::jobs::{user_id_from_headers, ApiError};

const PING_INTERVAL: Duration = Duration::from_secs(30);

fn to_sse(event: &Event) -> SseEvent {
    let payload = serde_json::to_string(event).unwrap_or_default();
    SseEvent::default().event(event.name()).data(payload)
}

pub async fn sse_chat_events(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ApiError>)> {
    let user_id = user_id_from_headers(&headers)?;
    let channel = Event::channel(&user_id);
    let subscription = state.deps.events.subscribe(&channel).await;

    let stream = stream::unfold(Some(subscription), |state| async move {
        let mut subscription: Subscription = state?;
        match tokio::time::timeout(PING_INTERVAL, subscription.recv()).await {
            Ok(Some(event)) => Some((Ok(to_sse(&event)), Some(subscription))),
            Ok(None) => None,
            Err(_elapsed) => Some((Ok(to_sse(&Event::Ping)), Some(subscription))),
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

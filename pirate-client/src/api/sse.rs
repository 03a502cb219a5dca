//! Server-Sent Events (SSE) broadcaster — streams the Session Store's
//! projected [`crate::session_store::Model`] to local UI consumers.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::{Stream, StreamExt};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::adapter::MusicSource;
use crate::api::server::AppState;

/// GET /events - SSE event stream of the local playback model.
pub async fn event_stream<S: MusicSource + 'static>(
    State(state): State<AppState<S>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("new SSE client connected");

    let rx = state.store.subscribe();
    let stream = WatchStream::new(rx).filter_map(|model| async move {
        match serde_json::to_string(&model) {
            Ok(json) => Some(Ok(Event::default().event("state").data(json))),
            Err(e) => {
                warn!(error = %e, "failed to serialize session model");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

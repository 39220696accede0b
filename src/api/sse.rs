//! Server-Sent Events support
//!
//! Frames are unnamed `data: <json>` events; the stream ends with
//! `data: [DONE]` after the run's terminal event.

use crate::events::RunEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

pub const DONE_MARKER: &str = "[DONE]";

/// Wire form of a run event. `None` for events clients never see.
pub fn wire_payload(event: &RunEvent) -> Option<Value> {
    let payload = match event {
        RunEvent::RunStarted { thread_id, run_id } => json!({
            "type": "start",
            "thread_id": thread_id,
            "run_id": run_id,
        }),
        RunEvent::ToolStarted {
            tool_name,
            arguments,
        } => json!({
            "type": "tool_start",
            "tool": tool_name,
            "input": arguments,
        }),
        RunEvent::ToolFinished {
            tool_name, output, ..
        } => json!({
            "type": "tool_end",
            "tool": tool_name,
            "output": output,
        }),
        RunEvent::RunCompleted { final_answer } => json!({
            "type": "complete",
            "result": final_answer,
        }),
        RunEvent::RunFailed { error } => json!({
            "type": "error",
            "message": error,
        }),
        RunEvent::ModelTurn { .. } => return None,
    };
    Some(payload)
}

fn data_event(payload: &Value) -> Result<Event, Infallible> {
    Ok(Event::default().data(payload.to_string()))
}

fn done_event() -> Result<Event, Infallible> {
    Ok(Event::default().data(DONE_MARKER))
}

fn with_keep_alive<S>(stream: S) -> Sse<S>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Convert a live run's events to an SSE stream.
///
/// Stops after the terminal event. A closed channel without one (the run
/// task went away) still ends the stream with `[DONE]`.
pub fn run_stream(
    rx: broadcast::Receiver<RunEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream::unfold(
        (BroadcastStream::new(rx), false),
        |(mut inner, finished)| async move {
            if finished {
                return None;
            }
            while let Some(item) = inner.next().await {
                match item {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        if let Some(payload) = wire_payload(&event) {
                            return Some((data_event(&payload), (inner, terminal)));
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "SSE subscriber lagged, events dropped");
                    }
                }
            }
            None
        },
    );

    with_keep_alive(events.chain(stream::once(async { done_event() })))
}

/// Stream for a run that already finished: its terminal event, then `[DONE]`
pub fn finished_stream(
    terminal: &RunEvent,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let frames: Vec<_> = wire_payload(terminal)
        .map(|payload| data_event(&payload))
        .into_iter()
        .chain(std::iter::once(done_event()))
        .collect();
    with_keep_alive(stream::iter(frames))
}

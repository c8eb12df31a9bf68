use std::convert::Infallible;

use futures::{Stream, StreamExt, future, stream};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{info, warn};
use uuid::Uuid;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::{ApiState, reject, with_state};
use crate::error::PipelineError;
use crate::models::{EventKind, ProgressEvent, Task, TaskState};
use crate::progress::ProgressSink;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamQuery {
  pub force_refresh: bool,
  pub reprocess: bool,
  pub only_failed: bool,
}

pub fn stream_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("forms" / Uuid / "analytics" / "stream")
    .and(warp::get())
    .and(warp::query::<StreamQuery>())
    .and(with_state(state))
    .and_then(handle_stream)
}

pub fn events_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / Uuid / "events").and(warp::get()).and(with_state(state)).and_then(handle_events)
}

fn to_sse(event: &ProgressEvent) -> Event {
  Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

/// Events of one run as SSE frames, ending after the first terminal event.
pub(crate) fn event_stream(
  preamble: Vec<ProgressEvent>,
  live: Option<broadcast::Receiver<ProgressEvent>>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
  let live = match live {
    Some(rx) => BroadcastStream::new(rx)
      .filter_map(|item| async move {
        match item {
          Ok(event) => Some(event),
          Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "Progress subscriber lagged");
            None
          }
        }
      })
      .left_stream(),
    None => stream::empty().right_stream(),
  };
  stream::iter(preamble)
    .chain(live)
    .scan(false, |finished, event| {
      if *finished {
        return future::ready(None);
      }
      *finished = event.kind.is_terminal();
      future::ready(Some(event))
    })
    .map(|event| Ok(to_sse(&event)))
}

/// The stored task as an event, for clients attaching mid-run.
pub(crate) fn snapshot(task: &Task) -> ProgressEvent {
  let kind = match task.state {
    TaskState::Completed => EventKind::Complete,
    TaskState::Failed | TaskState::Canceled => EventKind::Error,
    _ => EventKind::Progress,
  };
  ProgressEvent::new(task.task_id, kind, task.progress, task.message.clone())
}

async fn handle_stream(form_id: Uuid, query: StreamQuery, state: ApiState) -> Result<impl Reply, Rejection> {
  let task_id = Uuid::new_v4();
  let rx = state.bus.subscribe(task_id).await;

  let result = async {
    if query.reprocess {
      let modified = state.orchestrator.reprocess_all(form_id, query.only_failed).await?;
      let event = ProgressEvent::new(task_id, EventKind::Reprocessed, 0, format!("{modified} responses reset"))
        .with_modified_count(modified);
      state.bus.publish(event).await;
    }
    state.orchestrator.request_run_with_id(task_id, form_id, query.force_refresh).await
  }
  .await;

  match result {
    Ok(_) => info!(%form_id, %task_id, "Streaming analytics run"),
    Err(e) => {
      warn!(%form_id, %task_id, "Streamed run refused: {}", e);
      state.bus.publish(ProgressEvent::new(task_id, EventKind::Error, 0, e.public_message())).await;
    }
  }
  Ok(warp::sse::reply(warp::sse::keep_alive().stream(event_stream(Vec::new(), Some(rx)))))
}

async fn handle_events(task_id: Uuid, state: ApiState) -> Result<impl Reply, Rejection> {
  let tasks = &state.orchestrator.context().tasks;
  let known = tasks.get(task_id).await.map_err(reject)?;
  if known.is_none() {
    return Err(reject(PipelineError::not_found("task", task_id)));
  }

  let rx = state.bus.subscribe(task_id).await;
  let task = tasks
    .get(task_id)
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(PipelineError::not_found("task", task_id)))?;
  let first = snapshot(&task);
  let live = if first.kind.is_terminal() {
    drop(rx);
    state.bus.close(task_id).await;
    None
  } else {
    Some(rx)
  };
  Ok(warp::sse::reply(warp::sse::keep_alive().stream(event_stream(vec![first], live))))
}

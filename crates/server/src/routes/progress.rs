use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use aphrodite_core::progress_bus::ProgressEvent;
use db::models::job::Job;

use crate::state::AppState;

/// `WS /workflow/progress/{job_id}` — a subscriber joins the job's
/// broadcast channel on the progress bus and gets every event forwarded
/// as JSON text frames until the job reaches a terminal state and the
/// channel tears down, or the client disconnects.
pub async fn job_progress_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, job_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, job_id: Uuid) {
    let mut rx = state.progress_bus.subscribe(job_id);
    let (mut sender, mut receiver) = socket.split();

    // A fresh subscriber gets an immediate snapshot computed from stored
    // counters, not just whatever the bus happens to emit next.
    if let Ok(Some(job)) = Job::find_by_id(&state.pool, job_id).await {
        let snapshot = ProgressEvent {
            job_id,
            total_posters: job.total_posters,
            completed_posters: job.completed_posters,
            failed_posters: job.failed_posters,
            current_poster_id: None,
            timestamp: chrono::Utc::now(),
        };
        if let Ok(payload) = serde_json::to_string(&snapshot) {
            let _ = sender.send(Message::Text(payload.into())).await;
        }
    }

    let mut send_task = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let Ok(payload) = serde_json::to_string(&event) else { continue };
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
            if event.is_terminal() {
                break;
            }
        }
    });

    // Drain inbound frames so the connection stays alive; this socket is
    // read-only from the client's side.
    let mut recv_task = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

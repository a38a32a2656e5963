use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

use crate::coordinator::Coordinator;
use crate::error::ProctorError;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

/// Read-only state plus explicit commands for the dashboard and CLI.
pub fn control_routes(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    health_check()
        .or(status(coordinator.clone()))
        .or(chat_log(coordinator.clone()))
        .or(send_chat(coordinator.clone()))
        .or(start_all(coordinator.clone()))
        .or(stop_all(coordinator.clone()))
        .or(start_one(coordinator.clone()))
        .or(stop_one(coordinator.clone()))
        .or(export(coordinator.clone()))
        .or(close_room(coordinator))
}

pub fn health_check() -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "service": "Screen Proctor",
            "version": env!("CARGO_PKG_VERSION")
        }))
    })
}

fn status(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "status")
        .and(warp::get())
        .and(with_coordinator(coordinator))
        .and_then(|coordinator: Arc<Coordinator>| async move {
            Ok::<_, Infallible>(warp::reply::json(&coordinator.status().await))
        })
}

fn chat_log(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "chat")
        .and(warp::get())
        .and(with_coordinator(coordinator))
        .and_then(|coordinator: Arc<Coordinator>| async move {
            Ok::<_, Infallible>(warp::reply::json(&coordinator.chat_log().await))
        })
}

fn send_chat(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "chat")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_coordinator(coordinator))
        .and_then(|request: ChatRequest, coordinator: Arc<Coordinator>| async move {
            Ok::<_, Infallible>(match coordinator.send_chat(request.text).await {
                Ok(()) => accepted(),
                Err(e) => error_reply(&e),
            })
        })
}

fn start_all(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "recordings" / "start")
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and_then(|coordinator: Arc<Coordinator>| async move {
            Ok::<_, Infallible>(warp::reply::json(&coordinator.start_all_recordings().await))
        })
}

fn stop_all(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "recordings" / "stop")
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and_then(|coordinator: Arc<Coordinator>| async move {
            Ok::<_, Infallible>(warp::reply::json(&coordinator.stop_all_recordings().await))
        })
}

fn start_one(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "recordings" / String / "start")
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and_then(|identity: String, coordinator: Arc<Coordinator>| async move {
            let identity = decode(&identity);
            Ok::<_, Infallible>(match coordinator.start_recording(&identity).await {
                Ok(()) => accepted(),
                Err(e) => error_reply(&e),
            })
        })
}

fn stop_one(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "recordings" / String / "stop")
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and_then(|identity: String, coordinator: Arc<Coordinator>| async move {
            let identity = decode(&identity);
            Ok::<_, Infallible>(match coordinator.stop_recording(&identity).await {
                Ok(()) => accepted(),
                Err(e) => error_reply(&e),
            })
        })
}

fn export(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "export")
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and_then(|coordinator: Arc<Coordinator>| async move {
            Ok::<_, Infallible>(match coordinator.export().await {
                Ok(archive) => {
                    let disposition = format!("attachment; filename=\"{}\"", archive.file_name);
                    let reply = warp::reply::with_header(archive.bytes, "content-type", "application/zip");
                    warp::reply::with_header(reply, "content-disposition", disposition).into_response()
                }
                Err(e) => error_reply(&e),
            })
        })
}

fn close_room(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctor" / "room" / "close")
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and_then(|coordinator: Arc<Coordinator>| async move {
            Ok::<_, Infallible>(match coordinator.close_room().await {
                Ok(closing) => warp::reply::json(&serde_json::json!({ "closing": closing }))
                    .into_response(),
                Err(e) => error_reply(&e),
            })
        })
}

fn with_coordinator(
    coordinator: Arc<Coordinator>,
) -> impl Filter<Extract = (Arc<Coordinator>,), Error = Infallible> + Clone {
    warp::any().map(move || coordinator.clone())
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn accepted() -> Response {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "status": "ok" })),
        StatusCode::OK,
    )
    .into_response()
}

pub fn status_for(err: &ProctorError) -> StatusCode {
    match err {
        ProctorError::NoRoom | ProctorError::Recording { .. } => StatusCode::CONFLICT,
        ProctorError::NotAllowed(_) => StatusCode::FORBIDDEN,
        ProctorError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(err: &ProctorError) -> Response {
    tracing::warn!(error = %err, "Control request failed");
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": err.to_string() })),
        status_for(err),
    )
    .into_response()
}

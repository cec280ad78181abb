//! HTTP surface: DingTalk callback, liveness probe, images and transcripts.

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::chatbot::engine::ChatbotEngine;
use crate::chatbot::message::IncomingEvent;
use crate::chatbot::transcript::render_markdown;
use crate::gate::{EMPTY_PAYLOAD_MESSAGE, SignatureHeaders};

/// Shared state handed to every handler.
pub struct AppState {
    pub engine: Arc<ChatbotEngine>,
}

impl AppState {
    pub fn new(engine: Arc<ChatbotEngine>) -> Self {
        Self { engine }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(welcome).post(callback))
        .route("/images/{filename}", get(image))
        .route("/history/{filename}", get(history))
        .route("/download/{filename}", get(download))
        .with_state(state)
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

/// POST /
async fn callback(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let event: IncomingEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Malformed callback body: {}", e);
            return bad_request(&format!("bind to receive message failed: {e}"));
        }
    };
    let signature = SignatureHeaders {
        timestamp: header_str(&headers, "timestamp"),
        sign: header_str(&headers, "sign"),
    };

    match state.engine.handle_webhook(event, &signature).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) if e.is_bad_request() => bad_request(EMPTY_PAYLOAD_MESSAGE),
        Err(e) => {
            // Any reply owed has already been sent.
            debug!("Callback finished with: {}", e);
            StatusCode::OK.into_response()
        }
    }
}

/// GET /
async fn welcome() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "msg": "欢迎使用钉钉机器人"}))
}

/// Plain file name with no path components.
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

/// GET /images/{filename}
async fn image(State(state): State<Arc<AppState>>, Path(filename): Path<String>) -> Response {
    if !is_safe_filename(&filename) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = state.engine.images_dir().join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(e) => {
            debug!("Image {} not served: {}", filename, e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Transcript for `username[.md]`, `None` when the user has no records.
fn transcript_for(state: &AppState, filename: &str) -> Result<Option<(String, String)>, Response> {
    let username = filename.strip_suffix(".md").unwrap_or(filename);
    let records = state.engine.transcripts().list(username).map_err(|e| {
        error!("Failed to read transcript for {}: {}", username, e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;
    if records.is_empty() {
        return Ok(None);
    }
    Ok(Some((username.to_string(), render_markdown(&records))))
}

/// GET /history/{filename}
async fn history(State(state): State<Arc<AppState>>, Path(filename): Path<String>) -> Response {
    match transcript_for(&state, &filename) {
        Ok(Some((_, doc))) => ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], doc).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(response) => response,
    }
}

/// GET /download/{filename}
async fn download(State(state): State<Arc<AppState>>, Path(filename): Path<String>) -> Response {
    match transcript_for(&state, &filename) {
        Ok(Some((username, doc))) => {
            let disposition = format!(
                "attachment; filename*=UTF-8''{}.md",
                urlencoding::encode(&username)
            );
            (
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                doc,
            )
                .into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(response) => response,
    }
}

/// Serve until `shutdown` resolves, then give in-flight requests `grace`
/// before returning.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F, grace: Duration) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (stopping_tx, stopping_rx) = tokio::sync::oneshot::channel::<()>();
    let signal = async move {
        shutdown.await;
        info!("🛑 Shutting down server...");
        let _ = stopping_tx.send(());
    };

    let server = axum::serve(listener, router).with_graceful_shutdown(signal).into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result,
        _ = async {
            if stopping_rx.await.is_ok() {
                tokio::time::sleep(grace).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!("In-flight requests did not finish within {:?}, exiting anyway", grace);
            Ok(())
        }
    }
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_filenames() {
        assert!(is_safe_filename("3f2a.png"));
        assert!(!is_safe_filename(""));
        assert!(!is_safe_filename("../secret"));
        assert!(!is_safe_filename("a/b.png"));
        assert!(!is_safe_filename("a\\b.png"));
        assert!(!is_safe_filename(".env"));
    }

    /// Server with one `/slow` route that signals `entered` and then hangs.
    async fn slow_server(
        grace: Duration,
    ) -> (
        tokio::task::JoinHandle<std::io::Result<()>>,
        std::net::SocketAddr,
        tokio::sync::oneshot::Sender<()>,
        tokio::sync::mpsc::Receiver<()>,
    ) {
        let (entered_tx, entered_rx) = tokio::sync::mpsc::channel::<()>(1);
        let router = Router::new().route(
            "/slow",
            get(move || {
                let entered = entered_tx.clone();
                async move {
                    let _ = entered.send(()).await;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    "done"
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        let handle = tokio::spawn(serve(listener, router, shutdown, grace));
        (handle, addr, stop_tx, entered_rx)
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_by_grace() {
        use tokio::io::AsyncWriteExt;

        let grace = Duration::from_millis(300);
        let (handle, addr, stop, mut entered) = slow_server(grace).await;

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        entered.recv().await.unwrap();

        let started = std::time::Instant::now();
        stop.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("serve outlived its grace period")
            .unwrap();

        assert!(result.is_ok());
        assert!(started.elapsed() >= grace);
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(client);
    }

    #[tokio::test]
    async fn test_idle_shutdown_returns_promptly() {
        let (handle, _addr, stop, _entered) = slow_server(Duration::from_secs(30)).await;

        stop.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("idle server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}

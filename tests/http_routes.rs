//! HTTP surface tests driven through the router with `tower::ServiceExt`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use dingbridge::chatbot::backend::{BackendError, Completion, CompletionBackend, CompletionRequest};
use dingbridge::chatbot::lookup::{DomainLookup, LookupError};
use dingbridge::chatbot::message::{IncomingEvent, ReplyPayload};
use dingbridge::chatbot::reply::{ReplyChannel, ReplyError};
use dingbridge::chatbot::transcript::ChatType;
use dingbridge::chatbot::{ChatbotEngine, EngineConfig, EngineParts, SessionStore, TranscriptStore};
use dingbridge::config::SessionTtls;
use dingbridge::server::{AppState, build_router};

struct EchoBackend;

#[async_trait]
impl CompletionBackend for EchoBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BackendError> {
        Ok(Completion { text: format!("echo {}", request.prompt), thread_id: None })
    }

    async fn generate_image(&self, _prompt: &str) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Empty)
    }
}

#[derive(Default)]
struct RecordingReplier {
    sent: Mutex<Vec<ReplyPayload>>,
}

#[async_trait]
impl ReplyChannel for RecordingReplier {
    async fn send(&self, _event: &IncomingEvent, reply: ReplyPayload) -> Result<(), ReplyError> {
        self.sent.lock().unwrap().push(reply);
        Ok(())
    }
}

struct NoLookup;

#[async_trait]
impl DomainLookup for NoLookup {
    async fn domain_info(&self, domain: &str) -> Result<String, LookupError> {
        Err(LookupError::NotFound(domain.to_string()))
    }

    async fn certificate_info(&self, domain: &str) -> Result<String, LookupError> {
        Err(LookupError::NotFound(domain.to_string()))
    }
}

struct TestApp {
    router: axum::Router,
    transcripts: Arc<TranscriptStore>,
    replier: Arc<RecordingReplier>,
    images: tempfile::TempDir,
}

fn app() -> TestApp {
    let images = tempfile::tempdir().unwrap();
    let transcripts = Arc::new(TranscriptStore::in_memory().unwrap());
    let replier = Arc::new(RecordingReplier::default());
    let config = EngineConfig {
        help: "help text".into(),
        images_dir: images.path().to_path_buf(),
        ..Default::default()
    };
    let engine = ChatbotEngine::new(
        config,
        EngineParts {
            sessions: SessionStore::in_memory(SessionTtls::default()),
            transcripts: transcripts.clone(),
            backend: Arc::new(EchoBackend),
            replier: replier.clone(),
            lookup: Arc::new(NoLookup),
        },
    );
    let router = build_router(Arc::new(AppState::new(Arc::new(engine))));
    TestApp { router, transcripts, replier, images }
}

fn callback(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_welcome() {
    let response = app().router.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["msg"], "欢迎使用钉钉机器人");
}

#[tokio::test]
async fn test_malformed_callback_is_bad_request() {
    let response = app().router.oneshot(callback("{not json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_empty_callback_is_bad_request() {
    let body = r#"{"chatbotUserId": "bot", "senderStaffId": "s1", "text": {"content": ""}}"#;
    let response = app().router.oneshot(callback(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_help_callback_replies_and_returns_empty_ok() {
    let app = app();
    let body = r#"{"chatbotUserId": "bot", "senderStaffId": "s1", "senderNick": "Ada",
                  "conversationType": "1", "text": {"content": "帮助"}}"#;
    let response = app.router.oneshot(callback(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.is_empty());
    assert_eq!(app.replier.sent.lock().unwrap()[0].body, "help text");
}

#[tokio::test]
async fn test_chat_callback_records_transcript() {
    let app = app();
    let body = r#"{"chatbotUserId": "bot", "senderStaffId": "s1", "senderNick": "Ada",
                  "conversationType": "1", "text": {"content": "  你好啊  "}}"#;
    let response = app.router.oneshot(callback(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let records = app.transcripts.list("Ada").unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].content, "你好啊");
    assert_eq!(records[1].content, "echo 你好啊");
}

#[tokio::test]
async fn test_history_unknown_user_is_not_found() {
    let app = app();
    let response = app.router.oneshot(get("/history/nouser.md")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.transcripts.count().unwrap(), 0);
}

#[tokio::test]
async fn test_history_renders_markdown_inline() {
    let app = app();
    app.transcripts.append("alice", ChatType::Question, "what is rust?").unwrap();
    app.transcripts.append("alice", ChatType::Answer, "a language").unwrap();

    let response = app.router.oneshot(get("/history/alice.md")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());
    let doc = body_string(response).await;
    assert!(doc.find("## 🙋 alice 问").unwrap() < doc.find("## 🤖 机器人 答").unwrap());
}

#[tokio::test]
async fn test_download_is_attachment() {
    let app = app();
    app.transcripts.append("王五", ChatType::Question, "q").unwrap();

    let uri = format!("/download/{}.md", urlencoding::encode("王五"));
    let response = app.router.oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
    assert!(disposition.starts_with("attachment"));
    assert!(body_string(response).await.contains("王五"));
}

#[tokio::test]
async fn test_images_served_and_traversal_refused() {
    let app = app();
    std::fs::write(app.images.path().join("cat.png"), [1u8, 2, 3]).unwrap();

    let response = app.router.clone().oneshot(get("/images/cat.png")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

    let response = app.router.clone().oneshot(get("/images/..%2Fsecret")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.router.oneshot(get("/images/missing.png")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

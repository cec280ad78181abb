//! Integration tests against a real OpenAI-compatible backend.
//!
//! These tests require:
//! 1. `OPENAI_API_KEY` set in the environment
//! 2. Optionally `OPENAI_BASE_URL` for a compatible provider
//!
//! Run with: cargo test --features integ_test --test live_backend

#[cfg(feature = "integ_test")]
mod tests {
    use std::time::Duration;

    use dingbridge::chatbot::backend::{CompletionBackend, CompletionRequest, OpenAiBackend};
    use dingbridge::config::BackendConfig;

    fn backend() -> OpenAiBackend {
        let config = BackendConfig {
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY must be set"),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".into()),
            image_model: "dall-e-3".into(),
            timeout: Duration::from_secs(60),
            max_tokens: Some(64),
        };
        OpenAiBackend::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_completion_round_trip() {
        let completion = backend()
            .complete(CompletionRequest {
                prompt: "Reply with the single word: pong".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(completion.text.to_lowercase().contains("pong"));
    }

    #[tokio::test]
    async fn test_context_is_used() {
        let completion = backend()
            .complete(CompletionRequest {
                context: "Q: My name is Ada.\nA: Nice to meet you, Ada.".into(),
                prompt: "What is my name? Answer with the name only.".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(completion.text.contains("Ada"));
    }
}

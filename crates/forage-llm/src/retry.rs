use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::{info, warn};

use forage_core::config::{ModelConfig, RetryConfig};
use forage_core::error::{ForageError, Result};
use forage_core::traits::LlmClient;
use forage_core::types::*;

/// An LLM client that retries failed requests and falls back to alternative models.
///
/// Only the request itself is retried. Once a stream has been handed out
/// its errors belong to the caller.
pub struct RetryingClient {
    primary: Box<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LlmClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

fn http_status(msg: &str) -> Option<u16> {
    msg.strip_prefix("HTTP ")?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

fn is_retryable(e: &ForageError) -> bool {
    match e {
        ForageError::LlmRequest(msg) => match http_status(msg) {
            Some(status) => status == 408 || status == 429 || status >= 500,
            None => {
                let lower = msg.to_lowercase();
                lower.contains("timeout")
                    || lower.contains("timed out")
                    || lower.contains("connection")
            }
        },
        ForageError::LlmStream(_) => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        format: Option<&ResponseFormat>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let format = format.cloned();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            // Try primary with retries
            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self
                    .primary
                    .chat_stream(&config, messages.clone(), format.as_ref())
                    .await
                {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            // Primary exhausted, try fallbacks
            if !self.fallbacks.is_empty() {
                info!("Primary LLM exhausted, trying fallback models");
            }
            for (fb_config, fb_client) in &self.fallbacks {
                match fb_client
                    .chat_stream(fb_config, messages.clone(), format.as_ref())
                    .await
                {
                    Ok(stream) => {
                        info!(
                            model = %fb_config.model_id,
                            provider = %fb_config.provider,
                            "Fell back to alternative model"
                        );
                        return Ok(stream);
                    }
                    Err(e) => {
                        warn!(
                            model = %fb_config.model_id,
                            error = %e,
                            "Fallback model also failed"
                        );
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| ForageError::LlmRequest("All providers failed".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use futures::StreamExt;

    /// Fails with the given error `failures` times, then answers "ok".
    struct Flaky {
        failures: u32,
        error: fn() -> ForageError,
        calls: Arc<AtomicU32>,
    }

    impl LlmClient for Flaky {
        fn chat_stream(
            &self,
            _config: &ModelConfig,
            _messages: Vec<ChatMessage>,
            _format: Option<&ResponseFormat>,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.failures {
                    return Err((self.error)());
                }
                let deltas = vec![Ok(StreamDelta::TextDelta("ok".into()))];
                Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
            })
        }
    }

    fn model() -> ModelConfig {
        toml::from_str("model_id = \"gpt-4o\"").unwrap()
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    async fn first_text(stream: BoxStream<'_, Result<StreamDelta>>) -> String {
        let deltas: Vec<_> = stream.collect().await;
        match deltas.into_iter().next() {
            Some(Ok(StreamDelta::TextDelta(t))) => t,
            other => panic!("unexpected delta {other:?}"),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&ForageError::LlmRequest(
            "HTTP 429 Too Many Requests: slow down".into()
        )));
        assert!(is_retryable(&ForageError::LlmRequest("HTTP 503 Service Unavailable: x".into())));
        assert!(!is_retryable(&ForageError::LlmRequest("HTTP 401 Unauthorized: bad key".into())));
        assert!(!is_retryable(&ForageError::LlmRequest("HTTP 400 Bad Request: 500 tokens".into())));
        assert!(is_retryable(&ForageError::LlmRequest(
            "error sending request: connection refused".into()
        )));
        assert!(!is_retryable(&ForageError::Config("x".into())));
    }

    #[test]
    fn test_backoff_capped() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
        };
        let d = calculate_backoff(8, &cfg);
        assert!(d <= Duration::from_millis(4800));
        assert!(d >= Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingClient::new(
            Box::new(Flaky {
                failures: 2,
                error: || ForageError::LlmRequest("HTTP 502 Bad Gateway: upstream".into()),
                calls: calls.clone(),
            }),
            vec![],
            fast_retry(3),
        );
        let stream = client.chat_stream(&model(), vec![], None).await.unwrap();
        assert_eq!(first_text(stream).await, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_goes_to_fallback() {
        let primary_calls = Arc::new(AtomicU32::new(0));
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let client = RetryingClient::new(
            Box::new(Flaky {
                failures: u32::MAX,
                error: || ForageError::LlmRequest("HTTP 401 Unauthorized: no".into()),
                calls: primary_calls.clone(),
            }),
            vec![(
                model(),
                Box::new(Flaky {
                    failures: 0,
                    error: || ForageError::LlmRequest("unused".into()),
                    calls: fallback_calls.clone(),
                }) as Box<dyn LlmClient>,
            )],
            fast_retry(3),
        );
        let stream = client.chat_stream(&model(), vec![], None).await.unwrap();
        assert_eq!(first_text(stream).await, "ok");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_error() {
        let client = RetryingClient::new(
            Box::new(Flaky {
                failures: u32::MAX,
                error: || ForageError::LlmStream("reset".into()),
                calls: Arc::new(AtomicU32::new(0)),
            }),
            vec![],
            fast_retry(1),
        );
        let err = match client.chat_stream(&model(), vec![], None).await {
            Err(e) => e,
            Ok(_) => panic!("expected failure"),
        };
        assert!(matches!(err, ForageError::LlmStream(_)));
    }
}

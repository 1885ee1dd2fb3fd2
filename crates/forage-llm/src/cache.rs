use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use forage_core::config::ModelConfig;
use forage_core::error::{ForageError, Result};
use forage_core::traits::LlmClient;
use forage_core::types::*;

/// A completed reply stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// File-backed cache of completed LLM replies, one JSON file per request key.
///
/// Lives for a single run: the coordinator purges it before a run starts.
pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable key over everything that shapes the reply.
    pub fn key(
        config: &ModelConfig,
        messages: &[ChatMessage],
        format: Option<&ResponseFormat>,
    ) -> String {
        let material = serde_json::json!({
            "provider": config.provider,
            "model": config.model_id,
            "base_url": config.base_url,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "top_p": config.top_p,
            // timestamps would make every key unique
            "messages": messages
                .iter()
                .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
            "format": format,
        });
        let digest = Sha256::digest(material.to_string().as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let raw = tokio::fs::read_to_string(self.path_for(key)).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!(key, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, response: &CachedResponse) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.cache_error(e))?;
        let json = serde_json::to_string(response)?;
        tokio::fs::write(self.path_for(key), json)
            .await
            .map_err(|e| self.cache_error(e))
    }

    /// Delete the cache directory and everything in it.
    pub async fn purge(&self) -> Result<usize> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(0);
        }
        let count = self.len().await;
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .map_err(|e| self.cache_error(e))?;
        debug!(dir = %self.dir.display(), entries = count, "Purged response cache");
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        let mut count = 0;
        while let Ok(Some(_)) = entries.next_entry().await {
            count += 1;
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn cache_error(&self, e: std::io::Error) -> ForageError {
        ForageError::Cache(format!("{}: {e}", self.dir.display()))
    }
}

/// Wraps a client and replays replies for requests already answered in this run.
pub struct CachingClient {
    inner: Box<dyn LlmClient>,
    cache: Arc<ResponseCache>,
}

impl CachingClient {
    pub fn new(inner: Box<dyn LlmClient>, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }
}

impl LlmClient for CachingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        format: Option<&ResponseFormat>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let format = format.cloned();

        Box::pin(async move {
            let key = ResponseCache::key(&config, &messages, format.as_ref());

            if let Some(hit) = self.cache.get(&key).await {
                debug!(key = %&key[..12], "Response cache hit");
                let deltas = vec![
                    Ok(StreamDelta::TextDelta(hit.text)),
                    Ok(StreamDelta::Usage {
                        input_tokens: hit.input_tokens,
                        output_tokens: hit.output_tokens,
                    }),
                    Ok(StreamDelta::Stop(StopReason::EndTurn)),
                ];
                let replay = futures::stream::iter(deltas);
                return Ok(Box::pin(replay) as BoxStream<'_, Result<StreamDelta>>);
            }

            let stream = self
                .inner
                .chat_stream(&config, messages, format.as_ref())
                .await?;
            let cache = self.cache.clone();
            let mut recorded = CachedResponse {
                text: String::new(),
                input_tokens: 0,
                output_tokens: 0,
            };
            let mut finished = false;

            // record as deltas pass through; store once the stream ends cleanly
            let recording = stream
                .map(Some)
                .chain(futures::stream::iter([None]))
                .filter_map(move |delta| {
                    let mut finished_reply = None;
                    let out = match delta {
                        Some(delta) => {
                            match &delta {
                                Ok(StreamDelta::TextDelta(t)) => recorded.text.push_str(t),
                                Ok(StreamDelta::Usage {
                                    input_tokens,
                                    output_tokens,
                                }) => {
                                    recorded.input_tokens = *input_tokens;
                                    recorded.output_tokens = *output_tokens;
                                }
                                Ok(StreamDelta::Stop(StopReason::EndTurn)) => finished = true,
                                Ok(StreamDelta::Stop(_)) | Err(_) => finished = false,
                            }
                            Some(delta)
                        }
                        None => {
                            if finished && !recorded.text.is_empty() {
                                finished_reply = Some(recorded.clone());
                            }
                            None
                        }
                    };
                    let cache = cache.clone();
                    let key = key.clone();
                    async move {
                        if let Some(reply) = finished_reply {
                            if let Err(e) = cache.put(&key, &reply).await {
                                warn!(error = %e, "Failed to write response cache");
                            }
                        }
                        out
                    }
                });

            Ok(Box::pin(recording) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forage_test_utils::MockLlm;

    fn model() -> ModelConfig {
        toml::from_str("model_id = \"gpt-4o\"").unwrap()
    }

    async fn collect_text(stream: BoxStream<'_, Result<StreamDelta>>) -> String {
        let deltas: Vec<_> = stream.collect().await;
        deltas
            .into_iter()
            .filter_map(|d| match d {
                Ok(StreamDelta::TextDelta(t)) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_key_ignores_timestamps() {
        let a = vec![ChatMessage::system("plan"), ChatMessage::user("go")];
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = vec![ChatMessage::system("plan"), ChatMessage::user("go")];
        assert_eq!(
            ResponseCache::key(&model(), &a, None),
            ResponseCache::key(&model(), &b, None)
        );

        let format = ResponseFormat {
            name: "x".into(),
            schema: serde_json::json!({}),
        };
        assert_ne!(
            ResponseCache::key(&model(), &a, None),
            ResponseCache::key(&model(), &a, Some(&format))
        );
    }

    #[tokio::test]
    async fn test_second_identical_request_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResponseCache::new(dir.path().join(".cache")));
        let mock = MockLlm::new().with_text("{\"answer\":1}");
        let client = CachingClient::new(Box::new(mock.clone()), cache.clone());

        let msgs = vec![ChatMessage::user("same")];
        let first = client.chat_stream(&model(), msgs.clone(), None).await.unwrap();
        assert_eq!(collect_text(first).await, "{\"answer\":1}");
        assert_eq!(cache.len().await, 1);

        // the mock has no more scripted replies; a miss would error
        let second = client.chat_stream(&model(), msgs, None).await.unwrap();
        assert_eq!(collect_text(second).await, "{\"answer\":1}");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_purge_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path().join(".cache"));
        assert!(cache.is_empty().await);
        let entry = CachedResponse {
            text: "x".into(),
            input_tokens: 1,
            output_tokens: 1,
        };
        cache.put("k1", &entry).await.unwrap();
        cache.put("k2", &entry).await.unwrap();
        assert_eq!(cache.get("k1").await, Some(entry));
        assert_eq!(cache.purge().await.unwrap(), 2);
        assert!(!cache.dir().exists());
        assert!(cache.get("k1").await.is_none());
        assert_eq!(cache.purge().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path().join(".cache"));
        tokio::fs::create_dir_all(cache.dir()).await.unwrap();
        tokio::fs::write(cache.dir().join("bad.json"), "not json")
            .await
            .unwrap();
        assert!(cache.get("bad").await.is_none());
        assert_eq!(cache.len().await, 1);
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::data::cache::{CacheKey, ResponseCache};
use crate::error::{ConsistencyError, Result};
use crate::llm::schema::ResponseSchema;
use crate::monitoring::metrics;

/// Decoding knobs forwarded to the provider. Part of the cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl DecodingParams {
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Few-shot demonstration: a user turn and the structured answer expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub user: String,
    pub assistant: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub preface: Option<String>,
    pub examples: Vec<Example>,
    pub schema: ResponseSchema,
    pub params: DecodingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, schema: ResponseSchema) -> Self {
        Self {
            prompt: prompt.into(),
            preface: None,
            examples: Vec::new(),
            schema,
            params: DecodingParams::default(),
        }
    }

    pub fn with_preface(mut self, preface: impl Into<String>) -> Self {
        self.preface = Some(preface.into());
        self
    }

    pub fn with_examples(mut self, examples: Vec<Example>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_params(mut self, params: DecodingParams) -> Self {
        self.params = params;
        self
    }

    /// Everything that can change the response, in canonical form.
    pub fn cache_payload(&self, model: &str) -> Value {
        json!({
            "model": model,
            "prompt": self.prompt,
            "preface": self.preface,
            "examples": self.examples,
            "schema": self.schema.descriptor(),
            "params": self.params,
        })
    }
}

/// Structured text generation. Implementations return an object that
/// satisfies `request.schema`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model(&self) -> &str;

    async fn answer(&self, request: &GenerationRequest) -> Result<Value>;
}

/// Read-through / write-through cache in front of another generator.
pub struct CachedGenerator {
    inner: Arc<dyn TextGenerator>,
    cache: Arc<dyn ResponseCache>,
    read_only: bool,
}

impl CachedGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>, cache: Arc<dyn ResponseCache>, read_only: bool) -> Self {
        Self {
            inner,
            cache,
            read_only,
        }
    }
}

#[async_trait]
impl TextGenerator for CachedGenerator {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn answer(&self, request: &GenerationRequest) -> Result<Value> {
        let key = CacheKey::from_request(&request.cache_payload(self.inner.model()));

        if let Some(hit) = self.cache.get(&key)? {
            // A cached entry written under an older schema revision is a miss
            if request.schema.validate(&hit).is_ok() {
                metrics::record_cache_hit();
                return Ok(hit);
            }
            debug!("Discarding stale cache entry {} for {}", key.as_str(), request.schema.name);
        }
        metrics::record_cache_miss();

        if self.read_only {
            return Err(ConsistencyError::CacheMiss(format!(
                "{} ({})",
                key.as_str(),
                request.schema.name
            )));
        }

        let response = self.inner.answer(request).await?;
        request.schema.validate(&response)?;
        self.cache.put(&key, &response)?;
        Ok(response)
    }
}

/// Caps the number of in-flight generator calls. Share one instance (or one
/// semaphore) across every component that talks to the provider.
pub struct RateLimitedGenerator {
    inner: Arc<dyn TextGenerator>,
    permits: Arc<Semaphore>,
}

impl RateLimitedGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>, max_concurrency: usize) -> Self {
        Self::with_semaphore(inner, Arc::new(Semaphore::new(max_concurrency.max(1))))
    }

    pub fn with_semaphore(inner: Arc<dyn TextGenerator>, permits: Arc<Semaphore>) -> Self {
        Self { inner, permits }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl TextGenerator for RateLimitedGenerator {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn answer(&self, request: &GenerationRequest) -> Result<Value> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ConsistencyError::Generator(format!("semaphore closed: {}", e)))?;
        metrics::record_generator_call();
        self.inner.answer(request).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FnGenerator;
    use super::*;
    use crate::data::cache::MemoryCache;

    fn prob_request(prompt: &str) -> GenerationRequest {
        GenerationRequest::new(prompt, ResponseSchema::probability())
    }

    #[tokio::test]
    async fn test_cache_serves_second_call() {
        let inner = Arc::new(FnGenerator::new(|_| Ok(json!({"prob": 0.25}))));
        let cache = Arc::new(MemoryCache::new());
        let generator = CachedGenerator::new(inner.clone(), cache.clone(), false);

        let first = generator.answer(&prob_request("Will X happen?")).await.unwrap();
        let second = generator.answer(&prob_request("Will X happen?")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.call_count(), 1);

        generator.answer(&prob_request("Will Y happen?")).await.unwrap();
        assert_eq!(inner.call_count(), 2);
        assert_eq!(cache.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_decoding_params_change_key() {
        let inner = Arc::new(FnGenerator::new(|_| Ok(json!({"prob": 0.5}))));
        let generator = CachedGenerator::new(inner.clone(), Arc::new(MemoryCache::new()), false);

        generator.answer(&prob_request("Q")).await.unwrap();
        let hot = prob_request("Q").with_params(DecodingParams::default().with_temperature(0.8));
        generator.answer(&hot).await.unwrap();
        assert_eq!(inner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_read_only_miss_is_error() {
        let inner = Arc::new(FnGenerator::new(|_| Ok(json!({"prob": 0.5}))));
        let generator = CachedGenerator::new(inner.clone(), Arc::new(MemoryCache::new()), true);

        let err = generator.answer(&prob_request("Q")).await.unwrap_err();
        assert!(matches!(err, ConsistencyError::CacheMiss(_)));
        assert_eq!(inner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_response_not_cached() {
        let inner = Arc::new(FnGenerator::new(|_| Ok(json!({"prob": 2.0}))));
        let cache = Arc::new(MemoryCache::new());
        let generator = CachedGenerator::new(inner, cache.clone(), false);

        assert!(generator.answer(&prob_request("Q")).await.is_err());
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_rate_limiter_releases_permits() {
        let inner = Arc::new(FnGenerator::new(|_| Ok(json!({"prob": 0.5}))));
        let generator = Arc::new(RateLimitedGenerator::new(inner.clone(), 2));

        let calls = (0..10).map(|i| {
            let generator = generator.clone();
            async move { generator.answer(&prob_request(&format!("Q{}", i))).await }
        });
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(inner.call_count(), 10);
        assert_eq!(generator.available_permits(), 2);
    }
}

//! Stored-function signature discovery and its process-wide cache.

use std::{
	collections::HashMap,
	sync::Arc,
	time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{Backend, BackendError};

struct Entry {
	param_names: Vec<String>,
	created: Instant,
}

/// Shared `schema.function` → ordered parameter names map. Cloning shares
/// the underlying map, so every proxy built from the same cache benefits
/// from discoveries made by the others. Concurrent discovery of the same
/// key is harmless, the last writer wins.
#[derive(Clone, Default)]
pub struct SignatureCache {
	entries: Arc<RwLock<HashMap<String, Entry>>>,
	ttl: Option<Duration>,
}

impl SignatureCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Entries older than `ttl` are treated as misses and re-discovered.
	pub fn with_ttl(ttl: Duration) -> Self {
		SignatureCache {
			entries: Arc::default(),
			ttl: Some(ttl),
		}
	}

	pub async fn get(&self, key: &str) -> Option<Vec<String>> {
		let entries = self.entries.read().await;
		let entry = entries.get(key)?;
		if let Some(ttl) = self.ttl {
			if entry.created.elapsed() > ttl {
				return None;
			}
		}
		Some(entry.param_names.clone())
	}

	pub async fn insert(&self, key: &str, param_names: Vec<String>) {
		debug!(key, ?param_names, "Caching function signature");
		self.entries.write().await.insert(
			key.to_string(),
			Entry {
				param_names,
				created: Instant::now(),
			},
		);
	}

	pub async fn invalidate(&self, key: &str) {
		self.entries.write().await.remove(key);
	}

	pub async fn clear(&self) {
		self.entries.write().await.clear();
	}
}

/// Resolves the ordered parameter names of a stored function, consulting
/// the cache before the backend.
pub struct SignatureResolver {
	backend: Arc<dyn Backend>,
	cache: SignatureCache,
	schema: String,
}

impl SignatureResolver {
	pub fn new(backend: Arc<dyn Backend>, cache: SignatureCache, schema: &str) -> Self {
		SignatureResolver {
			backend,
			cache,
			schema: schema.to_string(),
		}
	}

	pub async fn resolve(&self, function: &str) -> Result<Vec<String>, BackendError> {
		let key = format!("{}.{function}", self.schema);
		if let Some(param_names) = self.cache.get(&key).await {
			return Ok(param_names);
		}
		let param_names = self
			.backend
			.signature(&self.schema, function)
			.await?
			.ok_or_else(|| BackendError::NotFound(function.to_string()))?;
		self.cache.insert(&key, param_names.clone()).await;
		Ok(param_names)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::backend::MockBackend;

	#[tokio::test]
	async fn cache_round_trip() {
		let cache = SignatureCache::new();
		assert_eq!(cache.get("public.add").await, None);
		cache
			.insert("public.add", vec!["a".to_string(), "b".to_string()])
			.await;
		assert_eq!(
			cache.get("public.add").await,
			Some(vec!["a".to_string(), "b".to_string()])
		);
	}

	#[tokio::test]
	async fn last_writer_wins() {
		let cache = SignatureCache::new();
		cache.insert("public.f", vec!["old".to_string()]).await;
		cache.insert("public.f", vec!["new".to_string()]).await;
		assert_eq!(cache.get("public.f").await, Some(vec!["new".to_string()]));
	}

	#[tokio::test]
	async fn expired_entry_is_a_miss() {
		let cache = SignatureCache::with_ttl(Duration::ZERO);
		cache.insert("public.f", vec!["a".to_string()]).await;
		tokio::time::sleep(Duration::from_millis(5)).await;
		assert_eq!(cache.get("public.f").await, None);
	}

	#[tokio::test]
	async fn invalidate_and_clear() {
		let cache = SignatureCache::new();
		cache.insert("public.f", vec![]).await;
		cache.insert("public.g", vec![]).await;
		cache.invalidate("public.f").await;
		assert_eq!(cache.get("public.f").await, None);
		assert!(cache.get("public.g").await.is_some());
		cache.clear().await;
		assert_eq!(cache.get("public.g").await, None);
	}

	#[tokio::test]
	async fn resolver_queries_backend_once_per_function() {
		let mut backend = MockBackend::new();
		backend
			.expect_signature()
			.times(1)
			.returning(|_, _| Ok(Some(vec!["x".to_string(), "y".to_string()])));
		let resolver = SignatureResolver::new(Arc::new(backend), SignatureCache::new(), "public");

		for _ in 0..3 {
			let names = resolver.resolve("multiply").await.unwrap();
			assert_eq!(names, vec!["x".to_string(), "y".to_string()]);
		}
	}

	#[tokio::test]
	async fn expired_entry_is_rediscovered() {
		let mut backend = MockBackend::new();
		backend
			.expect_signature()
			.times(2)
			.returning(|_, _| Ok(Some(vec!["a".to_string()])));
		let cache = SignatureCache::with_ttl(Duration::ZERO);
		let resolver = SignatureResolver::new(Arc::new(backend), cache, "public");

		resolver.resolve("f").await.unwrap();
		tokio::time::sleep(Duration::from_millis(5)).await;
		resolver.resolve("f").await.unwrap();
	}

	#[tokio::test]
	async fn missing_function_is_not_found() {
		let mut backend = MockBackend::new();
		backend.expect_signature().returning(|_, _| Ok(None));
		let resolver = SignatureResolver::new(Arc::new(backend), SignatureCache::new(), "public");

		let error = resolver.resolve("ghost").await.unwrap_err();
		assert!(matches!(error, BackendError::NotFound(name) if name == "ghost"));
	}
}

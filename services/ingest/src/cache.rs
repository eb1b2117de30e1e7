//! Cache invalidation for views derived from the staffing table.
//!
//! The caching layer itself lives outside this service; the pipeline only
//! needs to drop every derived read for a plan after that plan's rows change.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

/// Derived views keyed by plan id.
pub const DERIVED_VIEWS: [&str; 4] = ["ocupacao", "dashboard", "deficit", "vagas_disponiveis"];

/// Key patterns covering every derived view of `plan_id`.
pub fn plan_patterns(plan_id: &str) -> Vec<String> {
    DERIVED_VIEWS
        .iter()
        .map(|view| format!("{view}:{plan_id}:*"))
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Pattern-based cache invalidation.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Drops every key matching `pattern`; returns how many were dropped.
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError>;
}

/// Invalidator used when no cache is attached to the service.
#[derive(Debug, Default)]
pub struct NoCache;

#[async_trait]
impl CacheInvalidator for NoCache {
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        debug!(pattern = %pattern, "No cache attached, skipping invalidation");
        Ok(0)
    }
}

/// Invalidator that remembers every pattern it was asked to drop.
#[derive(Debug, Default)]
pub struct RecordingCache {
    patterns: Mutex<Vec<String>>,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl CacheInvalidator for RecordingCache {
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        self.patterns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pattern.to_string());
        Ok(0)
    }
}

//! robots.txt enforcement for scraped sources.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use robotstxt::DefaultMatcher;
use url::Url;
use wayfinder_core::error::AppError;
use wayfinder_core::traits::Fetcher;

/// Fetcher wrapper that consults the host's robots.txt before every fetch.
///
/// robots.txt bodies are cached per origin for the life of the fetcher. A
/// robots.txt that answers with a plain HTTP error (404 and friends) counts
/// as "no rules"; any other failure to read it blocks the fetch.
#[derive(Clone)]
pub struct RobotsFetcher<F> {
    inner: F,
    user_agent: String,
    cache: Arc<Mutex<HashMap<String, String>>>,
}

impl<F: Fetcher> RobotsFetcher<F> {
    pub fn new(inner: F, user_agent: impl Into<String>) -> Self {
        Self {
            inner,
            user_agent: user_agent.into(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cached(&self, origin: &str) -> Option<String> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| {
                tracing::warn!("Recovered from poisoned robots.txt cache mutex");
                poisoned.into_inner()
            })
            .get(origin)
            .cloned()
    }

    fn remember(&self, origin: String, body: String) {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(origin, body);
    }

    async fn robots_body(&self, origin: &str) -> Result<String, AppError> {
        if let Some(body) = self.cached(origin) {
            return Ok(body);
        }

        let robots_url = format!("{origin}/robots.txt");
        let body = match self.inner.fetch(&robots_url).await {
            Ok(body) => {
                tracing::info!(%robots_url, "Retrieved robots.txt");
                body
            }
            Err(AppError::HttpError(e)) => {
                tracing::info!(%robots_url, error = %e, "No robots.txt, assuming allowed");
                String::new()
            }
            Err(e) => {
                tracing::warn!(%robots_url, error = %e, "Failed to fetch robots.txt");
                return Err(e);
            }
        };
        self.remember(origin.to_string(), body.clone());
        Ok(body)
    }

    /// Whether `url` may be fetched under the host's robots.txt.
    pub async fn is_allowed(&self, url: &str) -> Result<bool, AppError> {
        let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;
        let origin = parsed.origin().ascii_serialization();
        let body = self.robots_body(&origin).await?;
        if body.trim().is_empty() {
            return Ok(true);
        }
        let mut matcher = DefaultMatcher::default();
        Ok(matcher.one_agent_allowed_by_robots(&body, &self.user_agent, url))
    }
}

impl<F: Fetcher> Fetcher for RobotsFetcher<F> {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        if !self.is_allowed(url).await? {
            tracing::warn!(%url, user_agent = %self.user_agent, "Blocked by robots.txt");
            return Err(AppError::ConfigError(format!(
                "{url} is disallowed by robots.txt"
            )));
        }
        self.inner.fetch(url).await
    }
}

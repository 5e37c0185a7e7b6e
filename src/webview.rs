//! Seam for browser-assisted collection.
//!
//! The engine never drives a browser itself. When a `webview` step suspends,
//! the registered [`WebviewHost`] is asked to open the page and watch for the
//! configured network response; whatever it intercepts comes back through
//! `CollectorEngine::deliver_webview_result`, tagged with the run id so a
//! window left open across a newer run cannot corrupt it.

use async_trait::async_trait;
use uuid::Uuid;

/// Everything a host needs to perform one scrape.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub source_id: String,
    /// Identifies the suspended run this scrape belongs to. Must be echoed
    /// back with the result.
    pub run_id: Uuid,
    pub url: String,
    /// Substring of the request URL whose response body should be captured.
    pub intercept_pattern: Option<String>,
}

/// Implemented by the embedding application (a desktop shell, a headless
/// browser driver, a test double).
#[async_trait]
pub trait WebviewHost: Send + Sync {
    /// Begins a scrape. Delivery of the intercepted payload happens later,
    /// out of band; this only kicks the browser off.
    async fn begin_scrape(&self, request: ScrapeRequest) -> anyhow::Result<()>;
}

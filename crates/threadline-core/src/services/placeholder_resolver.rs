use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// `[[encrypted:<attachment-id>]]`, emitted for attachments that cannot be decrypted yet.
static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[encrypted:[A-Za-z0-9_.\-]+\]\]").expect("placeholder pattern is valid")
});

pub fn has_placeholders(text: &str) -> bool {
    PLACEHOLDER_PATTERN.is_match(text)
}

pub fn strip_placeholders(text: &str) -> String {
    PLACEHOLDER_PATTERN.replace_all(text, "").into_owned()
}

/// Turns placeholder markers into renderable content once a key is available.
///
/// Returning the input unchanged means "not yet"; errors are treated the same way.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve(&self, content: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    /// No markers in the content.
    Plain,
    Resolved,
    /// Markers removed for display; no resolver available.
    Stripped,
    /// Markers removed for display while retries are pending.
    Retrying { attempt: u32 },
    /// Retries exhausted; markers stay stripped.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub text: String,
    pub status: ResolutionStatus,
}

impl RenderedContent {
    fn new(text: String, status: ResolutionStatus) -> Self {
        Self { text, status }
    }
}

/// Keeps rendered content free of raw placeholders, retrying resolution with a bound.
///
/// Each `update` cancels any pending retry for earlier content. The latest
/// rendering is published on a `watch` channel.
pub struct PlaceholderResolver {
    resolver: Option<Arc<dyn ContentResolver>>,
    retry_delay: Duration,
    max_retries: u32,
    rendered: Arc<watch::Sender<RenderedContent>>,
    retry_task: Option<JoinHandle<()>>,
}

impl PlaceholderResolver {
    pub fn new(resolver: Option<Arc<dyn ContentResolver>>, config: &EngineConfig) -> Self {
        Self::with_policy(
            resolver,
            Duration::from_millis(config.placeholder_retry_delay_ms),
            config.placeholder_max_retries,
        )
    }

    pub fn with_policy(
        resolver: Option<Arc<dyn ContentResolver>>,
        retry_delay: Duration,
        max_retries: u32,
    ) -> Self {
        let (tx, _rx) = watch::channel(RenderedContent::new(String::new(), ResolutionStatus::Plain));
        Self {
            resolver,
            retry_delay,
            max_retries,
            rendered: Arc::new(tx),
            retry_task: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RenderedContent> {
        self.rendered.subscribe()
    }

    pub fn current(&self) -> RenderedContent {
        self.rendered.borrow().clone()
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Render new content. Must be called from within a tokio runtime.
    pub async fn update(&mut self, content: String) -> RenderedContent {
        self.cancel_retry();

        if !has_placeholders(&content) {
            return self.publish(RenderedContent::new(content, ResolutionStatus::Plain));
        }

        let Some(resolver) = self.resolver.clone() else {
            return self.publish(RenderedContent::new(
                strip_placeholders(&content),
                ResolutionStatus::Stripped,
            ));
        };

        if let Some(resolved) = attempt(resolver.as_ref(), &content).await {
            return self.publish(RenderedContent::new(resolved, ResolutionStatus::Resolved));
        }

        let status = if self.max_retries == 0 {
            ResolutionStatus::TimedOut
        } else {
            ResolutionStatus::Retrying { attempt: 0 }
        };
        let rendered = self.publish(RenderedContent::new(strip_placeholders(&content), status));
        if self.max_retries > 0 {
            self.schedule_retry(resolver, content);
        }
        rendered
    }

    fn publish(&self, rendered: RenderedContent) -> RenderedContent {
        self.rendered.send_replace(rendered.clone());
        rendered
    }

    fn cancel_retry(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }

    fn schedule_retry(&mut self, resolver: Arc<dyn ContentResolver>, content: String) {
        let rendered = self.rendered.clone();
        let delay = self.retry_delay;
        let max_retries = self.max_retries;

        self.retry_task = Some(tokio::spawn(async move {
            for retry in 1..=max_retries {
                tokio::time::sleep(delay).await;
                if let Some(resolved) = attempt(resolver.as_ref(), &content).await {
                    rendered.send_replace(RenderedContent::new(resolved, ResolutionStatus::Resolved));
                    return;
                }
                if retry < max_retries {
                    rendered.send_modify(|current| {
                        current.status = ResolutionStatus::Retrying { attempt: retry };
                    });
                }
            }

            let timeout = EngineError::ResolutionTimeout {
                attempts: max_retries + 1,
            };
            debug!(error = %timeout, "Rendering content with placeholders stripped");
            rendered.send_modify(|current| current.status = ResolutionStatus::TimedOut);
        }));
    }
}

impl Drop for PlaceholderResolver {
    fn drop(&mut self) {
        self.cancel_retry();
    }
}

/// One resolution attempt. `None` when the resolver could not make progress.
async fn attempt(resolver: &dyn ContentResolver, content: &str) -> Option<String> {
    match resolver.resolve(content).await {
        Ok(resolved) if resolved != content => Some(strip_placeholders(&resolved)),
        Ok(_) => None,
        Err(e) => {
            debug!(error = ?e, "Placeholder resolution failed");
            None
        }
    }
}

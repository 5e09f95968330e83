use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::Coordinator;
use crate::provider::{Adapter, CompletionProvider, JobProvider};
use crate::router::Router;
use crate::types::{MediaProviderSettings, ProviderKind, Settings, TextProviderSettings};
use crate::{Error, FalProvider, OpenAIProvider};

impl Settings {
    /// Create settings from environment variables.
    ///
    /// A provider is configured when its key is set: `OPENAI_API_KEY` for the
    /// text provider, `FAL_KEY` for the media provider.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`Settings::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let number = |name: &str| -> Result<Option<u64>, Error> {
            var(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            Error::config(format!("{name} must be a positive integer, got '{value}'"))
                        })
                })
                .transpose()
        };

        let mut settings = Settings::default();

        if let Some(api_key) = var("OPENAI_API_KEY") {
            let mut text = TextProviderSettings::new(api_key);
            if let Some(base_url) = var("OPENAI_API_BASE") {
                text.base_url = base_url;
            }
            if let Some(model) = var("OPENAI_MODEL") {
                text.model = model;
            }
            if let Some(limit) = number("TEXT_MAX_CONCURRENCY")? {
                text.limits.max_concurrency = limit as usize;
            }
            settings.text = Some(text);
        }

        if let Some(api_key) = var("FAL_KEY") {
            let mut media = MediaProviderSettings::new(api_key);
            if let Some(queue_url) = var("FAL_QUEUE_URL") {
                media.queue_url = queue_url;
            }
            if let Some(model) = var("FAL_MODEL") {
                media.model = model;
            }
            if let Some(limit) = number("MEDIA_MAX_CONCURRENCY")? {
                media.limits.max_concurrency = limit as usize;
            }
            settings.media = Some(media);
        }

        if let Some(limit) = number("GLOBAL_MAX_CONCURRENCY")? {
            settings.global_max_concurrency = limit as usize;
        }
        if let Some(secs) = number("DEFAULT_TIMEOUT_SECS")? {
            settings.default_timeout = Duration::from_secs(secs);
        }

        if settings.text.is_none() && settings.media.is_none() {
            return Err(Error::config(
                "No provider credentials found in environment. Set OPENAI_API_KEY and/or FAL_KEY",
            ));
        }
        Ok(settings)
    }
}

/// Builds a ready [`Router`] from [`Settings`].
pub struct OrchestratorFactory;

impl OrchestratorFactory {
    /// Create the coordinator, adapters and router described by `settings`.
    pub fn create(settings: &Settings) -> Result<Router, Error> {
        if settings.text.is_none() && settings.media.is_none() {
            return Err(Error::config("at least one provider must be configured"));
        }

        let mut coordinator = Coordinator::new(settings.global_max_concurrency);
        let mut routes = Vec::with_capacity(2);

        if let Some(text) = &settings.text {
            let provider = OpenAIProvider::from_settings(text)?;
            coordinator = coordinator.with_provider(
                ProviderKind::TextCompletion,
                provider.name(),
                text.limits.max_concurrency,
                text.limits.rate_budget,
            );
            routes.push((
                ProviderKind::TextCompletion,
                Adapter::request_response(provider),
                text.limits.retry.clone(),
            ));
        }

        if let Some(media) = &settings.media {
            let provider = FalProvider::from_settings(media)?;
            coordinator = coordinator.with_provider(
                ProviderKind::MediaJob,
                provider.name(),
                media.limits.max_concurrency,
                media.limits.rate_budget,
            );
            routes.push((
                ProviderKind::MediaJob,
                Adapter::submit_and_await(provider),
                media.limits.retry.clone(),
            ));
        }

        let router = routes.into_iter().fold(
            Router::new(Arc::new(coordinator)).with_default_timeout(settings.default_timeout),
            |router, (kind, adapter, retry)| router.with_adapter(kind, adapter, retry),
        );
        tracing::debug!(?router, "orchestrator ready");
        Ok(router)
    }

    /// Create a router from environment variables.
    pub fn from_env() -> Result<Router, Error> {
        Self::create(&Settings::from_env()?)
    }
}

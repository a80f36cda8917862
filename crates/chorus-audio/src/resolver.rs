//! Resource resolution: turn an `audio_url` into playable bytes.

use std::time::Duration;

use async_trait::async_trait;
use chorus_core::AudioError;
use chorus_settings::AudioSettings;
use reqwest::{Client, Url, header};
use tracing::debug;

use crate::item::AudioHandle;

/// Maps a resource reference to audio data.
#[async_trait]
pub trait ResourceResolver: Send + Sync + 'static {
    /// Fetch or look up the audio behind `url`.
    async fn resolve(&self, url: &str) -> Result<AudioHandle, AudioError>;
}

/// Fetches audio over HTTP.
///
/// Relative references are joined onto the configured base URL. Bodies
/// larger than the limit are rejected while streaming.
#[derive(Clone, Debug)]
pub struct HttpResolver {
    client: Client,
    base_url: Option<Url>,
    max_bytes: u64,
}

impl HttpResolver {
    /// Build a resolver with an optional base URL for relative references.
    pub fn new(base_url: Option<&str>, max_bytes: u64, timeout: Duration) -> Result<Self, AudioError> {
        let base_url = base_url
            .map(|raw| Url::parse(raw).map_err(|e| AudioError::Resolve(format!("invalid base url {raw}: {e}"))))
            .transpose()?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AudioError::Resolve(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            max_bytes,
        })
    }

    /// Build from the audio section of the settings.
    pub fn from_settings(settings: &AudioSettings) -> Result<Self, AudioError> {
        Self::new(
            settings.base_url.as_deref(),
            settings.max_resource_bytes,
            settings.resolve_timeout(),
        )
    }

    /// Absolute URL for a resource reference. Absolute references win over
    /// the base URL.
    pub fn target(&self, reference: &str) -> Result<Url, AudioError> {
        let joined = match &self.base_url {
            Some(base) => base.join(reference),
            None => Url::parse(reference),
        };
        joined.map_err(|e| AudioError::Resolve(format!("cannot resolve {reference}: {e}")))
    }
}

#[async_trait]
impl ResourceResolver for HttpResolver {
    async fn resolve(&self, reference: &str) -> Result<AudioHandle, AudioError> {
        let url = self.target(reference)?;
        debug!(%url, "fetching audio");

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AudioError::Resolve(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AudioError::Resolve(format!("HTTP {status} for {url}")));
        }
        if let Some(size) = response.content_length() {
            if size > self.max_bytes {
                return Err(AudioError::TooLarge {
                    size,
                    limit: self.max_bytes,
                });
            }
        }
        let mime_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AudioError::Resolve(e.to_string()))?
        {
            body.extend_from_slice(&chunk);
            let size = body.len() as u64;
            if size > self.max_bytes {
                return Err(AudioError::TooLarge {
                    size,
                    limit: self.max_bytes,
                });
            }
        }
        if body.is_empty() {
            return Err(AudioError::Resolve(format!("empty body for {url}")));
        }

        debug!(%url, bytes = body.len(), "audio fetched");
        Ok(AudioHandle {
            url: url.to_string(),
            data: body.into(),
            mime_type,
            duration: None,
        })
    }
}

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::constants::IMGBB_UPLOAD_URL;
use crate::error::ProviderError;
use crate::normalize::encode_inline;
use crate::response::require_str;
use crate::transport::{ProviderPayload, Transport};

/// Publishes bytes and hands back a URL providers can fetch.
pub trait AssetSink: Send + Sync {
    fn publish(&self, data: &[u8], mime: &str) -> Result<String, ProviderError>;
}

/// Image host used for reference images of URL-only video providers.
pub struct ImgbbSink {
    transport: Arc<dyn Transport>,
    api_key: String,
    upload_url: String,
}

impl ImgbbSink {
    pub fn new(transport: Arc<dyn Transport>, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            api_key: api_key.into(),
            upload_url: IMGBB_UPLOAD_URL.to_string(),
        }
    }

    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = url.into();
        self
    }

    fn upload_request(&self, data: &[u8]) -> ProviderPayload {
        let fields = vec![
            ("key".to_string(), self.api_key.clone()),
            ("image".to_string(), encode_inline(data)),
        ];
        ProviderPayload::post_form(self.upload_url.as_str(), fields).timeout(Duration::from_secs(30))
    }
}

impl AssetSink for ImgbbSink {
    fn publish(&self, data: &[u8], mime: &str) -> Result<String, ProviderError> {
        if data.is_empty() {
            return Err(ProviderError::fatal("refusing to upload an empty image"));
        }
        let response = self.transport.call(&self.upload_request(data))?;
        let value = response.parse_json()?;
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let message = value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("upload rejected");
            return Err(ProviderError::fatal(format!("imgbb: {message}")));
        }
        let url = require_str(&value, &["/data/url", "/data/display_url"], "imgbb url")?;
        debug!(
            size = %bytesize::ByteSize(data.len() as u64),
            mime,
            "published reference image"
        );
        Ok(url.to_string())
    }
}

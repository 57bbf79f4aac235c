//! [`ResourceProvider`] backed by the content HTTP API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use crate::cache::{FetchError, ResourceProvider};
use crate::config::ProviderSettings;
use crate::domain::types::{ContextName, ResourceType, ResourceValue};

use super::error::InfraError;

pub struct HttpResourceProvider {
    client: Client,
    base_url: Url,
}

impl HttpResourceProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()
            .map_err(InfraError::HttpClient)?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("storefront-cache/", env!("CARGO_PKG_VERSION"))
    }

    /// URL serving `resource` for `context`. The admin shell reads the
    /// unpublished admin view; every other context reads the public one.
    pub fn endpoint(&self, resource: &ResourceType, context: ContextName) -> Result<Url, FetchError> {
        let family = match context {
            ContextName::Admin => "admin",
            ContextName::Storefront | ContextName::Delivery | ContextName::Shared => "public",
        };
        let segment = match resource {
            ResourceType::Theme => "theme",
            ResourceType::Banners => "banners",
            ResourceType::Footer => "footer",
            ResourceType::HomepageSections => "homepage-sections",
            ResourceType::Brands => "brands",
            ResourceType::Categories => "categories",
            ResourceType::Logo => "logo",
            ResourceType::Page(_) => "pages",
        };

        let mut url = self
            .base_url
            .join(&format!("{family}/{segment}"))
            .map_err(|err| FetchError::permanent(format!("invalid endpoint: {err}")))?;
        if let ResourceType::Page(path) = resource {
            url.query_pairs_mut().append_pair("path", path);
        }
        Ok(url)
    }
}

#[async_trait]
impl ResourceProvider for HttpResourceProvider {
    async fn fetch(
        &self,
        resource: &ResourceType,
        context: ContextName,
    ) -> Result<ResourceValue, FetchError> {
        let url = self.endpoint(resource, context)?;
        debug!(resource = %resource, context = %context, url = %url, "Fetching resource");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if let Some(error) = classify_status(status) {
            return Err(error);
        }

        let body = response.bytes().await.map_err(classify_transport_error)?;
        let payload: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| FetchError::permanent(format!("invalid JSON body: {err}")))?;
        ResourceValue::from_json(resource, payload).map_err(|err| {
            FetchError::permanent(format!("unexpected `{}` payload: {err}", resource.kind()))
        })
    }
}

/// `None` for success statuses.
fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }

    let message = format!("status {status}");
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    Some(if retryable {
        FetchError::transient(message)
    } else {
        FetchError::permanent(message)
    })
}

fn classify_transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_body() {
        FetchError::transient(err.to_string())
    } else {
        FetchError::permanent(err.to_string())
    }
}

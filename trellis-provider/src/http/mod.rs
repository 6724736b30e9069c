//! HTTP provider gateway client
//!
//! Speaks a provider-neutral JSON API. Resources live under
//! `/v1/{kind}` where `{kind}` is the kebab-case resource kind:
//!
//! - `GET /v1/{kind}?tag=key=value` lists, `GET /v1/{kind}/{id}` describes
//! - `POST /v1/{kind}` creates, `DELETE /v1/{kind}/{id}` deletes
//! - `POST /v1/{kind}/{id}/tags` tags, `PATCH /v1/{kind}/{id}` modifies attributes
//! - network, compute and load-balancing sub-resources are grouped in
//!   the sibling modules

mod compute;
mod network;
mod resources;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use trellis_core::ProviderError;
use trellis_core::domain::{Attributes, Resource, ResourceKind, TagFilter, Tags};
use trellis_core::dto::{AclEntry, Association, CreateResource, InstanceAction};

use crate::{CloudApi, Result};

/// HTTP client for a provider gateway
#[derive(Debug, Clone)]
pub struct HttpCloud {
    /// Base URL of the gateway (e.g., "http://localhost:8787")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl HttpCloud {
    /// Create a new gateway client
    ///
    /// # Example
    /// ```
    /// use trellis_provider::HttpCloud;
    ///
    /// let cloud = HttpCloud::new("http://localhost:8787/");
    /// assert_eq!(cloud.base_url(), "http://localhost:8787");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a gateway client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn resource_url(&self, kind: ResourceKind, id: &str) -> String {
        self.url(&format!("{}/{}", kind.as_str(), id))
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = Self::check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("failed to parse JSON response: {e}")))
    }

    /// Check the status code of a response without a body
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        Self::check_status(response).await.map(|_| ())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        debug!(status = status.as_u16(), %message, "provider gateway returned an error");

        Err(status_error(status, message))
    }
}

/// Map a gateway status code onto the provider error taxonomy
fn status_error(status: StatusCode, message: String) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::Unavailable(message)
        }
        _ => ProviderError::rejected(status.as_u16(), message),
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Unavailable(err.to_string())
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[async_trait]
impl CloudApi for HttpCloud {
    async fn list(&self, kind: ResourceKind, filter: &TagFilter) -> Result<Vec<Resource>> {
        self.list_resources(kind, filter).await
    }

    async fn describe(&self, kind: ResourceKind, id: &str) -> Result<Resource> {
        self.describe_resource(kind, id).await
    }

    async fn create(&self, request: CreateResource) -> Result<Resource> {
        self.create_resource(request).await
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()> {
        self.delete_resource(kind, id).await
    }

    async fn tag(&self, kind: ResourceKind, id: &str, tags: &Tags) -> Result<()> {
        self.tag_resource(kind, id, tags).await
    }

    async fn modify(&self, kind: ResourceKind, id: &str, attributes: &Attributes) -> Result<()> {
        self.modify_resource(kind, id, attributes).await
    }

    async fn associate(&self, association: &Association) -> Result<()> {
        self.create_association(association).await
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target_id: &str,
    ) -> Result<()> {
        self.add_route(route_table_id, destination, target_id).await
    }

    async fn instance_action(&self, instance_id: &str, action: InstanceAction) -> Result<()> {
        self.run_instance_action(instance_id, action).await
    }

    async fn attached_volumes(&self, instance_id: &str) -> Result<Vec<Resource>> {
        self.list_attached_volumes(instance_id).await
    }

    async fn acl_entries(&self, acl_id: &str) -> Result<Vec<AclEntry>> {
        self.get_acl_entries(acl_id).await
    }

    async fn replace_acl_entries(&self, acl_id: &str, entries: &[AclEntry]) -> Result<()> {
        self.put_acl_entries(acl_id, entries).await
    }

    async fn registered_targets(&self, target_group_id: &str) -> Result<Vec<String>> {
        self.get_targets(target_group_id).await
    }

    async fn set_targets(&self, target_group_id: &str, instance_ids: &[String]) -> Result<()> {
        self.put_targets(target_group_id, instance_ids).await
    }
}

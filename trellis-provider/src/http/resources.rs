//! Generic resource endpoints

use serde::Serialize;
use trellis_core::domain::{Attributes, Resource, ResourceKind, TagFilter, Tags};
use trellis_core::dto::CreateResource;

use super::{HttpCloud, transport_error};
use crate::Result;

#[derive(Serialize)]
struct CreateBody<'a> {
    attributes: &'a Attributes,
    tags: &'a Tags,
}

impl HttpCloud {
    // =============================================================================
    // Query
    // =============================================================================

    /// List resources of a kind matching every tag in the filter
    pub async fn list_resources(&self, kind: ResourceKind, filter: &TagFilter) -> Result<Vec<Resource>> {
        let query: Vec<(&str, String)> = filter
            .tags
            .iter()
            .map(|(key, value)| ("tag", format!("{key}={value}")))
            .collect();

        let response = self
            .client
            .get(self.url(kind.as_str()))
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_response(response).await
    }

    /// Describe one resource
    pub async fn describe_resource(&self, kind: ResourceKind, id: &str) -> Result<Resource> {
        let response = self
            .client
            .get(self.resource_url(kind, id))
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Mutation
    // =============================================================================

    pub async fn create_resource(&self, request: CreateResource) -> Result<Resource> {
        let response = self
            .client
            .post(self.url(request.kind.as_str()))
            .json(&CreateBody {
                attributes: &request.attributes,
                tags: &request.tags,
            })
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_response(response).await
    }

    pub async fn delete_resource(&self, kind: ResourceKind, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.resource_url(kind, id))
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_empty_response(response).await
    }

    pub async fn tag_resource(&self, kind: ResourceKind, id: &str, tags: &Tags) -> Result<()> {
        let url = format!("{}/tags", self.resource_url(kind, id));
        let response = self
            .client
            .post(url)
            .json(tags)
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_empty_response(response).await
    }

    pub async fn modify_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &Attributes,
    ) -> Result<()> {
        let response = self
            .client
            .patch(self.resource_url(kind, id))
            .json(attributes)
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_empty_response(response).await
    }
}

//! Instance, volume and target group endpoints

use trellis_core::domain::{Resource, ResourceKind};
use trellis_core::dto::InstanceAction;

use super::{HttpCloud, transport_error};
use crate::Result;

impl HttpCloud {
    /// Start, stop or terminate an instance
    pub async fn run_instance_action(&self, instance_id: &str, action: InstanceAction) -> Result<()> {
        let url = format!(
            "{}/actions/{}",
            self.resource_url(ResourceKind::Instance, instance_id),
            action.as_str()
        );
        let response = self.client.post(url).send().await.map_err(transport_error)?;

        self.handle_empty_response(response).await
    }

    pub async fn list_attached_volumes(&self, instance_id: &str) -> Result<Vec<Resource>> {
        let url = format!(
            "{}/volumes",
            self.resource_url(ResourceKind::Instance, instance_id)
        );
        let response = self.client.get(url).send().await.map_err(transport_error)?;

        self.handle_response(response).await
    }

    pub async fn get_targets(&self, target_group_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/targets",
            self.resource_url(ResourceKind::TargetGroup, target_group_id)
        );
        let response = self.client.get(url).send().await.map_err(transport_error)?;

        self.handle_response(response).await
    }

    /// Replace the registered members of a target group
    pub async fn put_targets(&self, target_group_id: &str, instance_ids: &[String]) -> Result<()> {
        let url = format!(
            "{}/targets",
            self.resource_url(ResourceKind::TargetGroup, target_group_id)
        );
        let response = self
            .client
            .put(url)
            .json(instance_ids)
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_empty_response(response).await
    }
}

//! Routing, association and network ACL endpoints

use serde::Serialize;
use trellis_core::domain::ResourceKind;
use trellis_core::dto::{AclEntry, Association};

use super::{HttpCloud, transport_error};
use crate::Result;

#[derive(Serialize)]
struct RouteBody<'a> {
    destination: &'a str,
    target: &'a str,
}

impl HttpCloud {
    /// Create or replace an association
    pub async fn create_association(&self, association: &Association) -> Result<()> {
        let response = self
            .client
            .post(self.url("associations"))
            .json(association)
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_empty_response(response).await
    }

    pub async fn add_route(&self, route_table_id: &str, destination: &str, target: &str) -> Result<()> {
        let url = format!(
            "{}/routes",
            self.resource_url(ResourceKind::RouteTable, route_table_id)
        );
        let response = self
            .client
            .post(url)
            .json(&RouteBody {
                destination,
                target,
            })
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_empty_response(response).await
    }

    pub async fn get_acl_entries(&self, acl_id: &str) -> Result<Vec<AclEntry>> {
        let url = format!("{}/entries", self.resource_url(ResourceKind::NetworkAcl, acl_id));
        let response = self.client.get(url).send().await.map_err(transport_error)?;

        self.handle_response(response).await
    }

    /// Replace the whole entry list of an ACL
    pub async fn put_acl_entries(&self, acl_id: &str, entries: &[AclEntry]) -> Result<()> {
        let url = format!("{}/entries", self.resource_url(ResourceKind::NetworkAcl, acl_id));
        let response = self
            .client
            .put(url)
            .json(entries)
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_empty_response(response).await
    }
}

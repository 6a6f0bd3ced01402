//! Authoritative deployment state.

use async_trait::async_trait;

use super::types::DeploymentRecord;
use crate::auth::{ApiClient, ApiError, ApiRequest};

/// Read access to the persisted deployment records.
#[async_trait]
pub trait DeploymentStore: Send + Sync + std::fmt::Debug {
    /// Current record for one deployment.
    async fn fetch(&self, deployment_id: &str) -> Result<DeploymentRecord, ApiError>;

    /// Deployment history for the same application, newest first.
    async fn history(&self, deployment_id: &str) -> Result<Vec<DeploymentRecord>, ApiError>;
}

/// [`DeploymentStore`] over the HTTP API.
#[derive(Debug, Clone)]
pub struct HttpDeploymentStore {
    client: ApiClient,
}

impl HttpDeploymentStore {
    /// Create a store using `client` (and its refresh coordinator).
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeploymentStore for HttpDeploymentStore {
    async fn fetch(&self, deployment_id: &str) -> Result<DeploymentRecord, ApiError> {
        self.client
            .json(&ApiRequest::get(format!("/api/deployments/{deployment_id}")))
            .await
    }

    async fn history(&self, deployment_id: &str) -> Result<Vec<DeploymentRecord>, ApiError> {
        self.client
            .json(&ApiRequest::get(format!("/api/deployments/{deployment_id}/history")))
            .await
    }
}

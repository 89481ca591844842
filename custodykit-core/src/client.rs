//! Stamped requests against the custody API.
//!
//! [`CustodyClient`] is the glue between a [`Stamper`] and the hosted API:
//! it signs the exact payload bytes it sends, attaches the stamp header,
//! decodes activity envelopes, and surfaces the consensus-needed condition
//! as a resumable error. Per-endpoint request builders are generated
//! elsewhere; this module only carries the submit/query/poll plumbing they
//! all go through.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::activity::{Activity, ActivityResponse, ActivityStatus};
use crate::defaults::ApiConfig;
use crate::error::CustodyKitError;
use crate::http::HttpClient;
use crate::poller::{ActivityFetcher, ActivityPoller, PollerConfig};
use crate::stamper::Stamper;

/// Path of the activity status query.
pub const GET_ACTIVITY_PATH: &str = "/public/v1/query/get_activity";

/// A client that stamps and submits requests to the custody API.
pub struct CustodyClient {
    config: ApiConfig,
    http: HttpClient,
    stamper: Arc<dyn Stamper>,
}

impl CustodyClient {
    /// Creates a client for `config`, authenticating with `stamper`.
    #[must_use]
    pub fn new(config: ApiConfig, stamper: Arc<dyn Stamper>) -> Self {
        Self {
            config,
            http: HttpClient::new(),
            stamper,
        }
    }

    /// The organization this client is scoped to.
    #[must_use]
    pub fn organization_id(&self) -> &str {
        self.config.organization_id()
    }

    /// Submits an operation and returns its activity.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::ConsensusNeeded`], carrying the activity
    /// id, when the operation requires additional approvers. Callers resume
    /// with [`Self::wait_for_activity`] once approvals may have landed.
    /// Transport and server failures propagate as their respective errors.
    pub async fn submit(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<Activity, CustodyKitError> {
        let activity = self.post_stamped(path, body).await?;

        if activity.status == ActivityStatus::ConsensusNeeded {
            return Err(CustodyKitError::ConsensusNeeded {
                activity_id: activity.id,
                status: activity.status,
            });
        }
        Ok(activity)
    }

    /// Queries the current state of an activity.
    ///
    /// # Errors
    /// Returns transport and server failures; the status itself is returned
    /// as data, not as an error.
    pub async fn get_activity(&self, activity_id: &str) -> Result<Activity, CustodyKitError> {
        let body = json!({
            "organizationId": self.config.organization_id(),
            "activityId": activity_id,
        });
        self.post_stamped(GET_ACTIVITY_PATH, &body).await
    }

    /// Polls an activity until it reaches a terminal state.
    ///
    /// # Errors
    /// Resolves with the terminal activity on success; rejects with
    /// [`CustodyKitError::ActivityFailed`] or
    /// [`CustodyKitError::PollingTimeout`] otherwise.
    pub async fn wait_for_activity(
        &self,
        activity_id: &str,
        config: PollerConfig,
    ) -> Result<Activity, CustodyKitError> {
        ActivityPoller::new(self.config.organization_id(), activity_id, config)
            .run(self)
            .await
    }

    async fn post_stamped(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<Activity, CustodyKitError> {
        let payload = serde_json::to_string(body)?;
        let stamp = self.stamper.stamp(&payload).await?;
        let url = format!("{}{path}", self.config.base_url());
        debug!(%url, header = %stamp.header_name, "submitting stamped request");

        let request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header(stamp.header_name.as_str(), stamp.header_value.as_str())
            .body(payload);
        let response = self.http.handle(request).await?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(CustodyKitError::Network {
                url,
                status: Some(status.as_u16()),
                error,
            });
        }

        let envelope: ActivityResponse = response.json().await?;
        Ok(envelope.activity)
    }
}

#[async_trait]
impl ActivityFetcher for CustodyClient {
    async fn fetch_activity(
        &self,
        organization_id: &str,
        activity_id: &str,
    ) -> Result<Activity, CustodyKitError> {
        let body = json!({
            "organizationId": organization_id,
            "activityId": activity_id,
        });
        self.post_stamped(GET_ACTIVITY_PATH, &body).await
    }
}

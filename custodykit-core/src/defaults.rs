use url::Url;

use crate::{error::CustodyKitError, Environment};

/// Base URL of the staging custody API.
pub const STAGING_API_URL: &str = "https://api.staging.custodykit.dev";
/// Base URL of the production custody API.
pub const PRODUCTION_API_URL: &str = "https://api.custodykit.dev";

/// Connection settings for the hosted custody API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    base_url: String,
    organization_id: String,
}

impl ApiConfig {
    /// Builds a config from an explicit base URL and organization id.
    ///
    /// # Errors
    /// Returns [`CustodyKitError::Configuration`] if the URL does not parse,
    /// uses plain HTTP against a non-loopback host, or the organization id is
    /// empty.
    pub fn new<U: Into<String>, O: Into<String>>(
        base_url: U,
        organization_id: O,
    ) -> Result<Self, CustodyKitError> {
        let base_url = base_url.into();
        let organization_id = organization_id.into();

        let url = Url::parse(&base_url).map_err(|e| {
            CustodyKitError::configuration(format!("invalid base url '{base_url}': {e}"))
        })?;
        let is_loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
        if url.scheme() != "https" && !(url.scheme() == "http" && is_loopback) {
            return Err(CustodyKitError::configuration(format!(
                "base url '{base_url}' must use https (plain http is only allowed for loopback)"
            )));
        }
        if organization_id.is_empty() {
            return Err(CustodyKitError::configuration(
                "organization id must not be empty",
            ));
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            organization_id,
        })
    }

    /// The API base URL, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The organization all requests are scoped to.
    #[must_use]
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }
}

/// Constructs a configuration with SDK defaults for a hosted environment.
pub trait DefaultConfig {
    /// Builds the config for `environment`, scoped to `organization_id`.
    ///
    /// # Errors
    /// Returns an error if the resulting configuration is invalid.
    fn from_environment(
        environment: &Environment,
        organization_id: String,
    ) -> Result<Self, CustodyKitError>
    where
        Self: Sized;
}

impl DefaultConfig for ApiConfig {
    fn from_environment(
        environment: &Environment,
        organization_id: String,
    ) -> Result<Self, CustodyKitError> {
        match environment {
            Environment::Staging => Self::new(STAGING_API_URL, organization_id),
            Environment::Production => Self::new(PRODUCTION_API_URL, organization_id),
        }
    }
}

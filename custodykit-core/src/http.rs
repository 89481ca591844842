use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, RequestBuilder, Response};

use crate::error::CustodyKitError;

/// A thin wrapper on an HTTP client for talking to the custody API. Sets
/// timeouts and a user-agent, and retries transient failures (429/5xx,
/// timeouts, connection errors) with exponential backoff.
pub(crate) struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl HttpClient {
    /// Initializes a new `HttpClient` instance.
    pub(crate) fn new() -> Self {
        let client = reqwest::Client::new();
        let timeout = Duration::from_secs(10);
        let max_retries = 3; // total attempts = 4
        Self {
            client,
            timeout,
            max_retries,
        }
    }

    /// Creates a POST request builder with defaults applied. URL scheme
    /// enforcement happens in `ApiConfig`, which every caller goes through.
    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.client
            .request(Method::POST, url)
            .timeout(self.timeout)
            .header(
                "User-Agent",
                format!("custodykit-core/{}", env!("CARGO_PKG_VERSION")),
            )
    }

    /// Sends a request built by `post`, retrying transient failures.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, CustodyKitError> {
        let Some(template) = request_builder.try_clone() else {
            // Streaming bodies cannot be retried; send once.
            return execute(request_builder).await.map_err(Into::into);
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries as usize);

        (|| async {
            let request_builder = template.try_clone().ok_or_else(|| {
                TransportError::permanent(
                    "<unknown>".to_string(),
                    None,
                    "request cannot be retried because it is not cloneable".to_string(),
                )
            })?;
            execute(request_builder).await
        })
        .retry(backoff)
        .when(TransportError::is_retryable)
        .await
        .map_err(Into::into)
    }
}

#[derive(Debug)]
struct TransportError {
    url: String,
    status: Option<u16>,
    error: String,
    retryable: bool,
}

impl TransportError {
    fn retryable(url: String, status: Option<u16>, error: String) -> Self {
        Self {
            url,
            status,
            error,
            retryable: true,
        }
    }

    fn permanent(url: String, status: Option<u16>, error: String) -> Self {
        Self {
            url,
            status,
            error,
            retryable: false,
        }
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<TransportError> for CustodyKitError {
    fn from(value: TransportError) -> Self {
        Self::Network {
            url: value.url,
            status: value.status,
            error: value.error,
        }
    }
}

async fn execute(request_builder: RequestBuilder) -> Result<Response, TransportError> {
    let (client, request) = request_builder.build_split();
    let request = request.map_err(|err| {
        TransportError::permanent(
            err.url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            None,
            format!("request build failed: {err}"),
        )
    })?;
    let url = request.url().to_string();

    match client.execute(request).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status == 429 || (500..600).contains(&status) {
                return Err(TransportError::retryable(
                    url,
                    Some(status),
                    format!("request error with bad status code {status}"),
                ));
            }
            Ok(resp)
        }
        Err(err) => {
            if err.is_timeout() || err.is_connect() {
                return Err(TransportError::retryable(
                    url,
                    None,
                    format!("request timeout/connect error: {err}"),
                ));
            }

            Err(TransportError::permanent(
                url,
                None,
                format!("request failed: {err}"),
            ))
        }
    }
}

//! JSON-over-HTTP clients for the live funds and matching services.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{
    Acknowledgement, FundsService, MatchingService, PlaceOrder, Placement, ReserveFunds,
    Reservation, ResourceCall, StepFailure, StepOutcome,
};

/// Raised while building a client, never during a call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid service url {0}")]
    InvalidUrl(String),

    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Base URL plus a pooled client shared by every call to one service.
#[derive(Debug, Clone)]
struct JsonService {
    client: Client,
    base: Url,
}

impl JsonService {
    fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let base = Url::parse(base_url)
            .map_err(|e| GatewayError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(GatewayError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Option<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut().ok()?.pop_if_empty().extend(segments);
        Some(url)
    }

    async fn post<B, T>(&self, segments: &[&str], body: &B) -> StepOutcome<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let Some(url) = self.endpoint(segments) else {
            return StepOutcome::FatalFailure(StepFailure::new(format!(
                "cannot build url from {}",
                self.base
            )));
        };

        let response = match self.client.post(url).json(body).send().await {
            Ok(response) => response,
            Err(e) => return classify_send_error(&e),
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<T>().await {
                Ok(value) => StepOutcome::Success(value),
                // The call went through; only the answer is unreadable.
                Err(e) => StepOutcome::FatalFailure(StepFailure::ambiguous(format!(
                    "unreadable response: {e}"
                ))),
            };
        }

        let body = response.text().await.unwrap_or_default();
        classify_status(status, body.trim())
    }
}

fn classify_send_error<T>(error: &reqwest::Error) -> StepOutcome<T> {
    if error.is_timeout() {
        StepOutcome::RetryableFailure(StepFailure::ambiguous(format!("request timed out: {error}")))
    } else if error.is_connect() {
        StepOutcome::RetryableFailure(StepFailure::new(format!("service unreachable: {error}")))
    } else if error.is_builder() {
        StepOutcome::FatalFailure(StepFailure::new(format!("invalid request: {error}")))
    } else {
        StepOutcome::RetryableFailure(StepFailure::ambiguous(format!("request failed: {error}")))
    }
}

fn classify_status<T>(status: StatusCode, body: &str) -> StepOutcome<T> {
    let message = if body.is_empty() {
        format!("service returned {status}")
    } else {
        format!("service returned {status}: {body}")
    };

    match status {
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::GATEWAY_TIMEOUT => {
            StepOutcome::RetryableFailure(StepFailure::ambiguous(message))
        }
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            StepOutcome::RetryableFailure(StepFailure::new(message))
        }
        _ => StepOutcome::FatalFailure(StepFailure::new(message)),
    }
}

/// Funds service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFundsClient {
    service: JsonService,
}

impl HttpFundsClient {
    /// `timeout` bounds a single request; the gateway's own timeout still
    /// applies on top.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            service: JsonService::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl FundsService for HttpFundsClient {
    async fn reserve_funds(&self, request: &ReserveFunds) -> StepOutcome<Reservation> {
        self.service.post(&["reservations"], request).await
    }

    async fn commit_reservation(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        self.service
            .post(&["reservations", request.resource_id.as_str(), "commit"], request)
            .await
    }

    async fn cancel_reservation(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        self.service
            .post(&["reservations", request.resource_id.as_str(), "cancel"], request)
            .await
    }
}

/// Matching service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMatchingClient {
    service: JsonService,
}

impl HttpMatchingClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            service: JsonService::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl MatchingService for HttpMatchingClient {
    async fn place_order(&self, request: &PlaceOrder) -> StepOutcome<Placement> {
        self.service.post(&["orders"], request).await
    }

    async fn cancel_order(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        self.service
            .post(&["orders", request.resource_id.as_str(), "cancel"], request)
            .await
    }
}

//! JSON REST client for the authoritative backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{CreateRequest, DeleteRequest, RemoteBackend, RemoteError, RemoteRecord, UpdateRequest};
use crate::error::{Error, Result};
use crate::models::{EntityId, EntityKind, Identity};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .ok_or_else(|| Error::Config("backend URL must not be empty".to_string()))?;
        if !is_http_url(&base_url) {
            return Err(Error::Config(
                "backend URL must include http:// or https://".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: normalize_text_option(token),
            timeout,
            client,
        })
    }

    fn entity_url(&self, kind: &EntityKind, id: Option<&EntityId>) -> String {
        match id {
            Some(id) => format!("{}/v1/entities/{kind}/{id}", self.base_url),
            None => format!("{}/v1/entities/{kind}", self.base_url),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(reqwest::header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> std::result::Result<reqwest::Response, RemoteError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|error| self.transport_error(&error))?;

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn record(&self, request: reqwest::RequestBuilder) -> std::result::Result<RemoteRecord, RemoteError> {
        self.send(request)
            .await?
            .json::<RemoteRecord>()
            .await
            .map_err(|error| RemoteError::InvalidResponse(error.to_string()))
    }

    fn transport_error(&self, error: &reqwest::Error) -> RemoteError {
        if error.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else if error.is_decode() {
            RemoteError::InvalidResponse(error.to_string())
        } else {
            RemoteError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn create(&self, kind: &EntityKind, request: CreateRequest) -> std::result::Result<RemoteRecord, RemoteError> {
        let builder = self
            .client
            .post(self.entity_url(kind, None))
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .json(&request);
        self.record(builder).await
    }

    async fn fetch(&self, kind: &EntityKind, id: &EntityId) -> std::result::Result<Option<RemoteRecord>, RemoteError> {
        match self.record(self.client.get(self.entity_url(kind, Some(id)))).await {
            Ok(record) => Ok(Some(record)),
            Err(RemoteError::NotFound) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn update(
        &self,
        kind: &EntityKind,
        id: &EntityId,
        request: UpdateRequest,
    ) -> std::result::Result<RemoteRecord, RemoteError> {
        let builder = self.client.patch(self.entity_url(kind, Some(id))).json(&request);
        self.record(builder).await
    }

    async fn delete(&self, kind: &EntityKind, id: &EntityId, request: DeleteRequest) -> std::result::Result<(), RemoteError> {
        let builder = self.client.delete(self.entity_url(kind, Some(id))).json(&request);
        self.send(builder).await.map(|_| ())
    }

    async fn current_identity(&self) -> std::result::Result<Identity, RemoteError> {
        self.send(self.client.get(format!("{}/v1/session", self.base_url)))
            .await?
            .json::<Identity>()
            .await
            .map_err(|error| RemoteError::InvalidResponse(error.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
    server_version: Option<i64>,
}

/// Map a non-success HTTP response to a classified error
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|payload| payload.message.clone().or_else(|| payload.error.clone()))
        .map(|message| compact_text(&message))
        .unwrap_or_else(|| {
            let trimmed = compact_text(body);
            if trimmed.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                trimmed
            }
        });

    match status {
        StatusCode::CONFLICT => RemoteError::Conflict {
            server_version: parsed.and_then(|payload| payload.server_version),
        },
        StatusCode::NOT_FOUND | StatusCode::GONE => RemoteError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(status.as_u16()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RemoteError::Server {
            status: status.as_u16(),
            message,
        },
        status if status.is_server_error() => RemoteError::Server {
            status: status.as_u16(),
            message,
        },
        status => RemoteError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_rejects_invalid_urls() {
        assert!(HttpBackend::new("", None, Duration::from_secs(1)).is_err());
        assert!(HttpBackend::new("api.example.com", None, Duration::from_secs(1)).is_err());
        assert!(HttpBackend::new("https://api.example.com/", None, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn debug_redacts_token() {
        let backend = HttpBackend::new(
            "https://api.example.com",
            Some("secret-token".into()),
            Duration::from_secs(1),
        )
        .unwrap();
        let rendered = format!("{backend:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn entity_urls_strip_trailing_slash() {
        let backend = HttpBackend::new("https://api.example.com/", None, Duration::from_secs(1)).unwrap();
        let kind = EntityKind::new("items").unwrap();
        let id = EntityId::new("42").unwrap();
        assert_eq!(
            backend.entity_url(&kind, Some(&id)),
            "https://api.example.com/v1/entities/items/42"
        );
    }

    #[test]
    fn classify_status_maps_conflict_with_version() {
        let error = classify_status(StatusCode::CONFLICT, r#"{"error":"stale","server_version":7}"#);
        assert_eq!(
            error,
            RemoteError::Conflict {
                server_version: Some(7)
            }
        );
    }

    #[test]
    fn classify_status_prefers_message_field() {
        let error = classify_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"invalid","message":"amount must be positive"}"#,
        );
        assert_eq!(
            error,
            RemoteError::Rejected {
                status: 422,
                message: "amount must be positive".into()
            }
        );
    }

    #[test]
    fn classify_status_treats_throttling_and_outages_as_transient() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "<html>").is_transient());
        assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn classify_status_falls_back_to_status_code() {
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "  "),
            RemoteError::Rejected {
                status: 400,
                message: "HTTP 400".into()
            }
        );
    }
}

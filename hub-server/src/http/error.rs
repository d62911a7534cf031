//! JSON error responses.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hub_core::{AdmissionMode, CostSnapshot, RejectReason};
use serde::Serialize;

use crate::error::{ErrorKind, HubError, RelayError};

/// A [`HubError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl<E: Into<HubError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<AdmissionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cost: Option<CostSnapshot>,
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::PrivacyViolation => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::AdmissionRejected | ErrorKind::ChannelUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::ConnectionLost | ErrorKind::MalformedRelayPayload => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        let retry_after = self.0.retry_after();

        let rejection = match &self.0 {
            HubError::Relay(RelayError::Rejected(r)) => Some(r.as_ref()),
            _ => None,
        };

        if status.is_server_error() {
            tracing::warn!(kind = kind.as_str(), error = %self.0, "request failed");
        } else {
            tracing::debug!(kind = kind.as_str(), error = %self.0, "request refused");
        }

        let body = ErrorBody {
            error: kind.as_str(),
            message: self.0.to_string(),
            retry_after_seconds: retry_after,
            mode: rejection.map(|r| r.mode),
            reason: rejection.map(|r| r.reason.clone()),
            cost: rejection.map(|r| r.cost),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use hub_core::Rejection;
    use hub_types::{AddressError, PeerId};

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn not_found_renders_kind_and_message() {
        let err = ApiError::from(RegistryError::NotFound(PeerId::new("ghost").unwrap()));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(RETRY_AFTER).is_none());

        let json = body_json(response).await;
        assert_eq!(json["error"], "not_found");
        assert!(json["message"].as_str().unwrap().contains("ghost"));
        assert!(json.get("retry_after_seconds").is_none());
    }

    #[tokio::test]
    async fn privacy_violation_is_forbidden() {
        let err = ApiError::from(RegistryError::Privacy(AddressError::RealAddress(
            "10.0.0.1:4000".into(),
        )));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "privacy_violation");
    }

    #[tokio::test]
    async fn rejection_carries_mode_and_retry_after() {
        let rejection = Rejection {
            reason: RejectReason::TopTierOnly,
            mode: AdmissionMode::Emergency,
            retry_after_secs: 300,
            cost: CostSnapshot::initial(100.0, 0),
        };
        let response = ApiError::from(RelayError::from(rejection)).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "300");

        let json = body_json(response).await;
        assert_eq!(json["error"], "admission_rejected");
        assert_eq!(json["retry_after_seconds"], 300);
        assert_eq!(json["mode"], "emergency");
        assert_eq!(json["reason"]["code"], "top_tier_only");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::MalformedRelayPayload), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::RateLimited), StatusCode::TOO_MANY_REQUESTS);
    }
}

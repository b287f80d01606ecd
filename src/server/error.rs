//! HTTP mapping for routing errors

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};

use crate::error::RouteError;

/// Everything a proxied handler can fail with
#[derive(Debug)]
pub enum ApiError {
    Route(RouteError),
    /// Request body exceeded the model-extraction cap
    PayloadTooLarge,
    /// Body carried no `model` field
    MissingModel,
    /// An apiKey is configured and the request did not present it
    Unauthorized,
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        ApiError::Route(err)
    }
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response<Body> {
        match self {
            ApiError::PayloadTooLarge => json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body exceeds the model extraction cap",
            ),
            ApiError::MissingModel => {
                json_error(StatusCode::BAD_REQUEST, "request carries no model field")
            }
            ApiError::Unauthorized => {
                json_error(StatusCode::UNAUTHORIZED, "invalid or missing api key")
            }
            ApiError::Route(err) => route_error_response(err),
        }
    }
}

fn route_error_response(err: RouteError) -> Response<Body> {
    match &err {
        RouteError::ModelNotFound(_) => json_error(StatusCode::NOT_FOUND, "model not found"),
        RouteError::GroupDenied(_) => {
            let body = serde_json::json!({ "error": err.to_string() }).to_string();
            Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header("content-type", "application/json")
                .header("retry-after", "5")
                .body(Body::from(body))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
        RouteError::StartFailure { id, log_excerpt } => {
            tracing::error!("`{}` failed to start: {}", id, log_excerpt);
            let body = serde_json::json!({
                "error": err.to_string(),
                "log": log_excerpt,
            })
            .to_string();
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
        RouteError::HealthTimeout { .. } => {
            json_error(StatusCode::GATEWAY_TIMEOUT, &err.to_string())
        }
        RouteError::Cancelled => {
            // The client is gone; nobody reads this. 499 keeps access logs
            // honest about what happened.
            Response::builder()
                .status(StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY))
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
        RouteError::PortExhausted => json_error(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
        RouteError::ConcurrencyLimit(_) => {
            json_error(StatusCode::TOO_MANY_REQUESTS, "concurrency limit reached")
        }
        RouteError::Upstream(_) => json_error(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

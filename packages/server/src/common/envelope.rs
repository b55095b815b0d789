//! JSON response envelope for the admin surface.
//!
//! Every admin route answers `{ok, data, error, request_id, system}` so
//! callers can switch on `ok` without inspecting status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Per-request correlation id, injected by middleware and echoed in the envelope.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    pub request_id: String,
    pub system: &'static str,
    /// Populated only in development builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_flags: Option<Value>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T, request_id: &RequestId) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            request_id: request_id.0.clone(),
            system: "tillbridge",
            dev_flags: dev_flags(),
        }
    }
}

#[cfg(debug_assertions)]
fn dev_flags() -> Option<Value> {
    Some(serde_json::json!({"debug_build": true}))
}

#[cfg(not(debug_assertions))]
fn dev_flags() -> Option<Value> {
    None
}

impl Envelope<Value> {
    pub fn err(code: &str, message: impl Into<String>, request_id: &RequestId) -> Self {
        Self::err_with_details(code, message, None, request_id)
    }

    pub fn err_with_details(
        code: &str,
        message: impl Into<String>,
        details: Option<Value>,
        request_id: &RequestId,
    ) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.into(),
                details,
            }),
            request_id: request_id.0.clone(),
            system: "tillbridge",
            dev_flags: dev_flags(),
        }
    }
}

/// An envelope paired with a status code, usable as an axum response.
pub struct EnvelopeResponse(pub StatusCode, pub Envelope<Value>);

impl IntoResponse for EnvelopeResponse {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_carries_data_and_request_id() {
        let rid = RequestId("req-1".to_string());
        let env = Envelope::ok(serde_json::json!({"id": 7}), &rid);
        assert!(env.ok);
        assert_eq!(env.request_id, "req-1");
        assert!(env.error.is_none());
    }

    #[test]
    fn err_envelope_sets_code_and_clears_data() {
        let rid = RequestId::generate();
        let env = Envelope::err("bad_request", "missing type", &rid);
        assert!(!env.ok);
        assert!(env.data.is_none());
        assert_eq!(env.error.as_ref().unwrap().code, "bad_request");
    }
}

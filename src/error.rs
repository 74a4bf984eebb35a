//! JSON error responses for the `/api` surface
//!
//! Errors from the transcoding layer are expressed as gRPC status codes (local
//! failures such as malformed JSON are mapped onto the closest code) and rendered
//! the way grpc-gateway renders them: `{"code": <int>, "message": "...", "details": []}`.

use hyper::{Response, StatusCode};
use serde::Serialize;
use tonic::Code;

use crate::{full, ResponseBody};

/// Header carrying the symbolic gRPC code of a failed API call
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Map a gRPC status code onto the HTTP status the gateway answers with
pub fn http_status_from_code(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        // Client closed request (nginx convention, same as grpc-gateway)
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Symbolic name of a gRPC code for the X-Gateway-Error header
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Numeric gRPC code
    pub code: i32,
    /// Human-readable error message
    pub message: String,
    /// Status details (always empty, kept for wire compatibility)
    pub details: Vec<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":{},"message":"{}","details":[]}}"#,
                self.code,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with an explicit HTTP status
pub fn json_error_response(
    status: StatusCode,
    code: Code,
    message: impl Into<String>,
) -> Response<ResponseBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_GATEWAY_ERROR, code_name(code))
        .body(full(body))
        .expect("valid response with StatusCode and static headers")
}

/// Render a gRPC status as a gateway error response
pub fn status_response(status: &tonic::Status) -> Response<ResponseBody> {
    json_error_response(
        http_status_from_code(status.code()),
        status.code(),
        status.message(),
    )
}

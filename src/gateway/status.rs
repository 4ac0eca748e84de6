//! Translation between gRPC results and REST responses

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::{Code, Status};

/// Prefix marking a REST header as gRPC metadata to forward
pub const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";

/// HTTP status for a gRPC status code
#[must_use]
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        // Client closed request, non-standard
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON body of a failed REST call
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
    pub details: Vec<serde_json::Value>,
}

/// A gRPC status rendered as a REST error
#[derive(Debug)]
pub struct GatewayError(pub Status);

impl GatewayError {
    /// Error for a path no plugin registered
    #[must_use]
    pub fn not_found() -> Self {
        Self(Status::not_found("Not Found"))
    }
}

impl From<Status> for GatewayError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = http_status(self.0.code());
        let body = ErrorBody {
            code: self.0.code() as i32,
            message: self.0.message().to_string(),
            details: Vec::new(),
        };

        (status, Json(body)).into_response()
    }
}

/// Render a unary gRPC result as a REST response
#[must_use]
pub fn forward<T: Serialize>(result: Result<tonic::Response<T>, Status>) -> Response {
    match result {
        Ok(response) => Json(response.into_inner()).into_response(),
        Err(status) => {
            tracing::debug!(code = ?status.code(), error = status.message(), "backend call failed");
            GatewayError(status).into_response()
        }
    }
}

/// Build a gRPC request carrying the metadata found in REST headers
#[must_use]
pub fn grpc_request<T>(message: T, headers: &HeaderMap) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = metadata_from_headers(headers);
    request
}

/// Extract forwardable metadata from REST headers
///
/// `authorization` is forwarded as is; `grpc-metadata-<key>` headers are
/// forwarded as `<key>`. Binary keys and invalid values are dropped.
#[must_use]
pub fn metadata_from_headers(headers: &HeaderMap) -> MetadataMap {
    let mut metadata = MetadataMap::new();

    for (name, value) in headers {
        let name = name.as_str();
        let key = if name == "authorization" {
            name
        } else if let Some(key) = name.strip_prefix(METADATA_HEADER_PREFIX) {
            key
        } else {
            continue;
        };

        if key.is_empty() || key.ends_with("-bin") {
            continue;
        }

        let (Ok(key), Ok(value)) = (
            key.parse::<AsciiMetadataKey>(),
            AsciiMetadataValue::try_from(value.as_bytes()),
        ) else {
            continue;
        };
        metadata.append(key, value);
    }

    metadata
}

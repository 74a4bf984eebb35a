//! JSON to gRPC transcoding for the `/api` surface
//!
//! `POST /{package.Service}/{Method}` with a JSON body becomes a unary call on the
//! upstream connection. The services are whatever the descriptor set loaded at
//! startup describes. Responses keep proto field names and render enums as numbers.

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor, SerializeOptions};
use std::path::{Path, PathBuf};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::Code;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{json_error_response, status_response};
use crate::router::{ApiHandler, X_REQUEST_ID};
use crate::{full, ResponseBody};

/// Request headers with this prefix are forwarded as call metadata
pub const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to read descriptor set {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid descriptor set {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: prost_reflect::DescriptorError,
    },
}

pub struct Transcoder {
    pool: DescriptorPool,
    connection: Connection,
}

impl Transcoder {
    pub fn new(pool: DescriptorPool, connection: Connection) -> Self {
        Self { pool, connection }
    }

    /// Register the services of `descriptor_set` on `connection`
    ///
    /// Without a descriptor set every API call answers 404.
    pub fn register(
        connection: Connection,
        descriptor_set: Option<&Path>,
    ) -> Result<Self, TranscodeError> {
        let pool = match descriptor_set {
            Some(path) => load_descriptor_set(path)?,
            None => {
                warn!("No descriptor set configured; the /api surface has no services");
                DescriptorPool::new()
            }
        };

        let transcoder = Self::new(pool, connection);
        info!(services = ?transcoder.services(), "API services registered");
        Ok(transcoder)
    }

    pub fn services(&self) -> Vec<String> {
        self.pool
            .services()
            .map(|s| s.full_name().to_string())
            .collect()
    }

    /// Resolve `/{package.Service}/{Method}`
    pub fn resolve(&self, path: &str) -> Option<MethodDescriptor> {
        let (service, method) = path.trim_start_matches('/').split_once('/')?;
        self.pool
            .get_service_by_name(service)?
            .methods()
            .find(|m| m.name() == method)
    }

    async fn call(&self, request: Request<Bytes>) -> Response<ResponseBody> {
        let Some(method) = self.resolve(request.uri().path()) else {
            return json_error_response(StatusCode::NOT_FOUND, Code::NotFound, "Not Found");
        };

        if request.method() != Method::POST {
            let mut response = json_error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                Code::Unimplemented,
                "Method Not Allowed",
            );
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("POST"));
            return response;
        }

        if method.is_client_streaming() || method.is_server_streaming() {
            return json_error_response(
                StatusCode::NOT_IMPLEMENTED,
                Code::Unimplemented,
                format!("streaming method {} is not supported", method.full_name()),
            );
        }

        let message = match decode_request(&method, request.body()) {
            Ok(message) => message,
            Err(e) => {
                debug!(method = %method.full_name(), error = %e, "Malformed request body");
                return json_error_response(StatusCode::BAD_REQUEST, Code::InvalidArgument, e);
            }
        };

        let mut call = tonic::Request::new(message);
        forward_metadata(request.headers(), call.metadata_mut());

        match self.connection.unary_dynamic(&method, call).await {
            Ok(response) => {
                let (metadata, message, _) = response.into_parts();
                match encode_response(&message) {
                    Ok(body) => {
                        let mut response = Response::new(full(body));
                        response.headers_mut().insert(
                            header::CONTENT_TYPE,
                            HeaderValue::from_static("application/json"),
                        );
                        copy_response_metadata(&metadata, response.headers_mut());
                        response
                    }
                    Err(e) => {
                        warn!(method = %method.full_name(), error = %e, "Failed to encode response");
                        json_error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Code::Internal,
                            "failed to encode response",
                        )
                    }
                }
            }
            Err(status) => {
                debug!(method = %method.full_name(), code = ?status.code(), message = %status.message(), "Upstream call failed");
                status_response(&status)
            }
        }
    }
}

#[async_trait]
impl ApiHandler for Transcoder {
    async fn handle(&self, request: Request<Bytes>) -> Response<ResponseBody> {
        self.call(request).await
    }
}

pub fn load_descriptor_set(path: &Path) -> Result<DescriptorPool, TranscodeError> {
    let bytes = std::fs::read(path).map_err(|source| TranscodeError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    DescriptorPool::decode(bytes.as_slice()).map_err(|source| TranscodeError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// An empty body is the empty message
fn decode_request(method: &MethodDescriptor, body: &Bytes) -> Result<DynamicMessage, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DynamicMessage::new(method.input()));
    }

    let mut deserializer = serde_json::Deserializer::from_slice(body);
    let message = DynamicMessage::deserialize(method.input(), &mut deserializer)
        .map_err(|e| e.to_string())?;
    deserializer.end().map_err(|e| e.to_string())?;
    Ok(message)
}

fn encode_response(message: &DynamicMessage) -> Result<Vec<u8>, serde_json::Error> {
    let options = SerializeOptions::new()
        .use_proto_field_name(true)
        .use_enum_numbers(true);

    let mut body = Vec::new();
    let mut serializer = serde_json::Serializer::new(&mut body);
    message.serialize_with_options(&mut serializer, &options)?;
    Ok(body)
}

fn forward_metadata(headers: &HeaderMap, metadata: &mut MetadataMap) {
    for (name, value) in headers {
        let key = match name.as_str().strip_prefix(METADATA_HEADER_PREFIX) {
            Some(key) => key,
            None if name.as_str() == X_REQUEST_ID => X_REQUEST_ID,
            None => continue,
        };

        let (Ok(key), Ok(value)) = (
            key.parse::<AsciiMetadataKey>(),
            AsciiMetadataValue::try_from(value.as_bytes()),
        ) else {
            debug!(header = %name, "Skipping header that is not valid call metadata");
            continue;
        };

        metadata.append(key, value);
    }
}

fn copy_response_metadata(metadata: &MetadataMap, headers: &mut HeaderMap) {
    for entry in metadata.iter() {
        if let tonic::metadata::KeyAndValueRef::Ascii(key, value) = entry {
            let name = format!("{}{}", METADATA_HEADER_PREFIX, key.as_str());
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_encoded_bytes()),
            ) {
                headers.append(name, value);
            }
        }
    }
}

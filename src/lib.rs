//! omni-inspector - an edge gateway in front of an Omni control plane
//!
//! This library provides the pieces of a small edge process that:
//! - Provisions (or decodes) the service account it authenticates with
//! - Opens a single gRPC connection to the control plane with TLS, gzip and a
//!   receive size cap
//! - Transcodes `/api/*` JSON requests into unary gRPC calls on that connection
//! - Serves the frontend bundle with SPA fallback and a fixed security-header policy

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;

pub mod assets;
pub mod cli;
pub mod codec;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod management;
pub mod router;
pub mod server;
pub mod static_files;
pub mod transcode;

/// Response body type shared by every handler
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

pub(crate) fn full(chunk: impl Into<Bytes>) -> ResponseBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

//! Outbound gRPC connection to the control plane
//!
//! The endpoint is normalized once (`https` defaults to 443, `http` is treated as
//! plaintext `grpc`, which defaults to 80) and a single HTTP/2 client is built over
//! it. Nothing is dialed until the first call; dial errors surface as an
//! `unavailable` status on that call.

use hyper::http::uri::PathAndQuery;
use hyper::Uri;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tonic::client::Grpc;
use tonic::codec::{CompressionEncoding, ProstCodec};
use tonic::{Request, Response, Status};
use tracing::{debug, warn};
use url::{Host, Url};

use crate::codec::DynamicCodec;
use crate::config::UpstreamConfig;
use crate::credentials::{CredentialError, ServiceAccountCredential};
use crate::interceptor::{BearerAuthInterceptor, InterceptorChain};

/// Largest response message accepted from the upstream
pub const MAX_RECEIVE_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("unsupported endpoint scheme '{0}' (expected https, http or grpc)")]
    UnsupportedScheme(String),

    #[error("failed to load CA certificate {path}: {reason}")]
    CaCert { path: PathBuf, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("invalid upstream origin: {0}")]
    Origin(String),

    #[error("failed to build authentication interceptor: {0}")]
    Auth(#[source] Box<CredentialError>),
}

/// Transport mode derived from the endpoint scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `grpc://` (or `http://`): HTTP/2 with prior knowledge
    Plaintext,
    /// `https://`
    Tls,
}

/// Normalized upstream endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl EndpointSpec {
    pub fn parse(endpoint: &str) -> Result<Self, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };

        let url = Url::parse(endpoint.trim()).map_err(|e| invalid(e.to_string()))?;

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid("missing host".to_string())),
        };

        let (scheme, port) = match url.scheme() {
            "https" => (Scheme::Tls, url.port_or_known_default().unwrap_or(443)),
            "http" | "grpc" => (Scheme::Plaintext, url.port().unwrap_or(80)),
            other => return Err(ConnectionError::UnsupportedScheme(other.to_string())),
        };

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn target(&self) -> String {
        match IpAddr::from_str(&self.host) {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    fn origin(&self) -> Result<Uri, ConnectionError> {
        let scheme = match self.scheme {
            Scheme::Tls => "https",
            Scheme::Plaintext => "http",
        };

        format!("{}://{}", scheme, self.target())
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ConnectionError::Origin(e.to_string()))
    }
}

/// TLS knobs taken from configuration
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<PathBuf>,
}

impl From<&UpstreamConfig> for TlsOptions {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            insecure_skip_verify: config.insecure_skip_tls_verify,
            ca_cert: config.ca_cert.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSecurity {
    Plaintext,
    Tls {
        insecure_skip_verify: bool,
        ca_cert: Option<PathBuf>,
    },
}

/// Everything needed to open the upstream connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: EndpointSpec,
    pub security: TransportSecurity,
    pub interceptors: InterceptorChain,
    pub compression: CompressionEncoding,
    pub max_receive_message_size: usize,
    /// Multiplex every call over one shared HTTP/2 connection
    pub shared_write_buffer: bool,
}

impl ConnectionConfig {
    pub fn target(&self) -> String {
        self.endpoint.target()
    }
}

pub struct ConnectionFactory;

impl ConnectionFactory {
    /// Resolve the endpoint and assemble the interceptor chain
    ///
    /// With a credential, its bearer interceptor runs before `interceptors`.
    pub fn build_config(
        endpoint: &str,
        credential: Option<&ServiceAccountCredential>,
        mut interceptors: InterceptorChain,
        tls: &TlsOptions,
    ) -> Result<ConnectionConfig, ConnectionError> {
        let endpoint = EndpointSpec::parse(endpoint)?;

        if let Some(credential) = credential {
            let auth = BearerAuthInterceptor::new(credential)
                .map_err(|e| ConnectionError::Auth(Box::new(e)))?;
            interceptors.prepend(Arc::new(auth));
        }

        let security = match endpoint.scheme() {
            Scheme::Tls => TransportSecurity::Tls {
                insecure_skip_verify: tls.insecure_skip_verify,
                ca_cert: tls.ca_cert.clone(),
            },
            Scheme::Plaintext => {
                if tls.insecure_skip_verify {
                    debug!("insecure_skip_tls_verify has no effect on a plaintext endpoint");
                }
                TransportSecurity::Plaintext
            }
        };

        Ok(ConnectionConfig {
            endpoint,
            security,
            interceptors,
            compression: CompressionEncoding::Gzip,
            max_receive_message_size: MAX_RECEIVE_MESSAGE_SIZE,
            shared_write_buffer: true,
        })
    }

    /// Build the client; no network I/O happens here
    pub fn connect(config: &ConnectionConfig) -> Result<Connection, ConnectionError> {
        let tls_config = client_tls_config(&config.security)?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http2()
            .wrap_connector(http);

        let transport = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .pool_max_idle_per_host(if config.shared_write_buffer { 1 } else { 0 })
            .build(connector);

        let grpc = Grpc::with_origin(transport, config.endpoint.origin()?)
            .send_compressed(config.compression)
            .accept_compressed(config.compression)
            .max_decoding_message_size(config.max_receive_message_size);

        debug!(
            upstream = %config.target(),
            max_receive_message_size = config.max_receive_message_size,
            "Upstream client built"
        );

        Ok(Connection {
            grpc,
            interceptors: config.interceptors.clone(),
            target: config.target(),
        })
    }
}

type Transport = Client<HttpsConnector<HttpConnector>, tonic::body::BoxBody>;

/// Cheap to clone; clones share the underlying HTTP/2 connection
#[derive(Clone)]
pub struct Connection {
    grpc: Grpc<Transport>,
    interceptors: InterceptorChain,
    target: String,
}

impl Connection {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Unary call with compiled message types
    pub async fn unary<Req, Resp>(
        &self,
        path: &'static str,
        request: Request<Req>,
    ) -> Result<Response<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let (mut grpc, request) = self.prepare(request).await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();

        grpc.unary(request, PathAndQuery::from_static(path), codec)
            .await
            .map_err(transport_status)
    }

    /// Unary call with messages described by `method`
    pub async fn unary_dynamic(
        &self,
        method: &MethodDescriptor,
        request: Request<DynamicMessage>,
    ) -> Result<Response<DynamicMessage>, Status> {
        let path = method_path(method)?;
        let (mut grpc, request) = self.prepare(request).await?;

        grpc.unary(request, path, DynamicCodec::new(method.clone()))
            .await
            .map_err(transport_status)
    }

    async fn prepare<T>(
        &self,
        mut request: Request<T>,
    ) -> Result<(Grpc<Transport>, Request<T>), Status> {
        self.interceptors.apply(&mut request)?;

        let mut grpc = self.grpc.clone();
        grpc.ready().await.map_err(|e| {
            warn!(upstream = %self.target, error = %e, "Upstream not ready");
            Status::unavailable(format!("upstream {} not ready: {}", self.target, e))
        })?;

        Ok((grpc, request))
    }
}

/// Dial failures come back from tonic as `unknown`; report them as `unavailable`
fn transport_status(status: Status) -> Status {
    let connect_failed = std::error::Error::source(&status)
        .and_then(|e| e.downcast_ref::<hyper_util::client::legacy::Error>())
        .map(|e| e.is_connect())
        .unwrap_or(false);

    if connect_failed {
        Status::unavailable(format!("upstream unreachable: {}", status.message()))
    } else {
        status
    }
}

/// `/{package.Service}/{Method}`
pub fn method_path(method: &MethodDescriptor) -> Result<PathAndQuery, Status> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    PathAndQuery::from_str(&path)
        .map_err(|e| Status::internal(format!("invalid method path {}: {}", path, e)))
}

fn client_tls_config(security: &TransportSecurity) -> Result<ClientConfig, ConnectionError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;

    let config = match security {
        TransportSecurity::Tls {
            insecure_skip_verify: true,
            ..
        } => {
            warn!("TLS certificate verification is disabled for the upstream connection");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                .with_no_client_auth()
        }
        TransportSecurity::Tls { ca_cert, .. } => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            if let Some(path) = ca_cert {
                for cert in load_ca_certs(path)? {
                    roots.add(cert).map_err(|e| ConnectionError::CaCert {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                }
                debug!(path = %path.display(), "Extra CA certificates trusted");
            }

            builder.with_root_certificates(roots).with_no_client_auth()
        }
        // The connector only hands plaintext origins to the inner HttpConnector
        TransportSecurity::Plaintext => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };

    Ok(config)
}

fn load_ca_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConnectionError> {
    let ca_error = |reason: String| ConnectionError::CaCert {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| ca_error(e.to_string()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ca_error(e.to_string()))?;

    if certs.is_empty() {
        return Err(ca_error("no certificates found".to_string()));
    }

    Ok(certs)
}

/// Accepts any server certificate; signatures are still checked
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

//! Outbound call interceptors
//!
//! Interceptors only touch call metadata, so one chain serves unary and
//! streaming calls alike. The chain is applied explicitly to every
//! `tonic::Request` right before it is dispatched.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::{Request, Status};
use tracing::warn;

use crate::credentials::{CredentialError, ServiceAccountCredential};

/// Metadata key carrying the bearer token
pub const AUTHORIZATION_METADATA_KEY: &str = "authorization";
/// Scheme prefix of the authorization value
pub const BEARER_PREFIX: &str = "Bearer ";

/// Lifetime of a minted call token
pub const TOKEN_LIFETIME_SECS: i64 = 300;

/// A hook run on the metadata of every outbound call
pub trait CallInterceptor: Send + Sync {
    /// Short label used in logs
    fn name(&self) -> &'static str;

    fn intercept(&self, metadata: &mut MetadataMap) -> Result<(), Status>;
}

/// Ordered list of interceptors, applied first to last
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn CallInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor
    pub fn with(mut self, interceptor: impl CallInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Insert an interceptor in front of all others
    pub fn prepend(&mut self, interceptor: Arc<dyn CallInterceptor>) {
        self.interceptors.insert(0, interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run every interceptor against the request metadata, stopping at the first error
    pub fn apply<T>(&self, request: &mut Request<T>) -> Result<(), Status> {
        for interceptor in &self.interceptors {
            interceptor.intercept(request.metadata_mut()).map_err(|status| {
                warn!(interceptor = interceptor.name(), error = %status, "Call interceptor rejected request");
                status
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Sends a fixed bearer token, used for the administrative bootstrap connection
pub struct StaticTokenInterceptor {
    value: AsciiMetadataValue,
}

impl StaticTokenInterceptor {
    pub fn new(token: &str) -> Result<Self, CredentialError> {
        let value = format!("{}{}", BEARER_PREFIX, token.trim())
            .parse()
            .map_err(|_| CredentialError::Decode("admin token is not valid ASCII".to_string()))?;
        Ok(Self { value })
    }
}

impl CallInterceptor for StaticTokenInterceptor {
    fn name(&self) -> &'static str {
        "static-token"
    }

    fn intercept(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        metadata.insert(AUTHORIZATION_METADATA_KEY, self.value.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallClaims {
    pub sub: String,
    pub name: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs a short-lived ES256 token for every call with the service account key
pub struct BearerAuthInterceptor {
    encoding_key: EncodingKey,
    subject: String,
    name: String,
    key_id: String,
    not_after: DateTime<Utc>,
}

impl BearerAuthInterceptor {
    pub fn new(credential: &ServiceAccountCredential) -> Result<Self, CredentialError> {
        let key = credential.key();
        let encoding_key = EncodingKey::from_ec_pem(key.private_key_pem().as_bytes())?;

        Ok(Self {
            encoding_key,
            subject: credential.name().full_id(),
            name: credential.name().name().to_string(),
            key_id: key.fingerprint(),
            not_after: key.not_after(),
        })
    }

    /// Mint a token valid from `now` until five minutes later or key expiry
    pub fn token_at(&self, now: DateTime<Utc>) -> Result<String, jsonwebtoken::errors::Error> {
        let exp = (now + Duration::seconds(TOKEN_LIFETIME_SECS)).min(self.not_after);
        let claims = CallClaims {
            sub: self.subject.clone(),
            name: self.name.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());

        encode(&header, &claims, &self.encoding_key)
    }
}

impl CallInterceptor for BearerAuthInterceptor {
    fn name(&self) -> &'static str {
        "service-account"
    }

    fn intercept(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        let token = self
            .token_at(Utc::now())
            .map_err(|e| Status::unauthenticated(format!("failed to sign call token: {}", e)))?;

        let value = format!("{}{}", BEARER_PREFIX, token)
            .parse::<AsciiMetadataValue>()
            .map_err(|_| Status::internal("call token is not valid metadata"))?;

        metadata.insert(AUTHORIZATION_METADATA_KEY, value);
        Ok(())
    }
}

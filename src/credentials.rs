//! Service account credentials and their provisioning
//!
//! A credential is either handed to the process in encoded form, or minted at
//! startup: a fresh ECDSA P-256 key is generated, any identity already registered
//! under the same name is destroyed, and a new identity bound to the fresh public
//! key is created. Only one process may provision a given name at a time; two
//! concurrent bootstraps will destroy each other's identities.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rcgen::KeyPair;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::ConnectionError;
use crate::management::GrpcIdentityRegistry;

/// Domain suffix of service account identities
pub const SERVICE_ACCOUNT_DOMAIN: &str = "serviceaccount.omni.sidero.dev";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to decode service account credential: {0}")]
    Decode(String),

    #[error("service account key for {name} expired at {not_after}")]
    Expired {
        name: String,
        not_after: DateTime<Utc>,
    },

    #[error("invalid service account name '{0}'")]
    InvalidName(String),

    #[error("failed to generate service account key: {0}")]
    KeyGeneration(#[from] rcgen::Error),

    #[error("failed to open administrative connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("management call failed: {0}")]
    Remote(#[source] Status),

    #[error("service account {name} was destroyed but could not be recreated: {source}")]
    IdentityLost {
        name: String,
        #[source]
        source: Status,
    },

    #[error("failed to prepare call token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("service account provisioning was cancelled")]
    Cancelled,
}

/// Name of a service account, e.g. `omni-inspector`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccountName {
    name: String,
}

impl ServiceAccountName {
    /// Accepts either the base name or the full identity ID
    pub fn parse(value: &str) -> Result<Self, CredentialError> {
        let value = value.trim();
        let name = value
            .strip_suffix(SERVICE_ACCOUNT_DOMAIN)
            .and_then(|rest| rest.strip_suffix('@'))
            .unwrap_or(value);

        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if !valid {
            return Err(CredentialError::InvalidName(value.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity ID, `<name>@serviceaccount.omni.sidero.dev`
    pub fn full_id(&self) -> String {
        format!("{}@{}", self.name, SERVICE_ACCOUNT_DOMAIN)
    }
}

impl fmt::Display for ServiceAccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_id())
    }
}

/// ECDSA P-256 signing key with its validity window
#[derive(Clone)]
pub struct ServiceAccountKey {
    private_key_pem: String,
    public_key_pem: String,
    fingerprint: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl ServiceAccountKey {
    pub fn generate(lifetime: Duration) -> Result<Self, CredentialError> {
        Self::generate_at(Utc::now(), lifetime)
    }

    pub fn generate_at(now: DateTime<Utc>, lifetime: Duration) -> Result<Self, CredentialError> {
        let key_pair = KeyPair::generate()?;
        Ok(Self::from_key_pair(&key_pair, now, now + lifetime))
    }

    fn from_key_pair(
        key_pair: &KeyPair,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Self {
        Self {
            private_key_pem: key_pair.serialize_pem(),
            public_key_pem: key_pair.public_key_pem(),
            fingerprint: hex::encode(Sha256::digest(key_pair.public_key_der())),
            not_before,
            not_after,
        }
    }

    /// PKCS#8 PEM of the private key
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// SubjectPublicKeyInfo PEM registered with the identity
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// SHA-256 of the DER public key, hex encoded
    pub fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("fingerprint", &self.fingerprint)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedCredential {
    name: String,
    key: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

/// Identity name plus signing key
#[derive(Debug, Clone)]
pub struct ServiceAccountCredential {
    name: ServiceAccountName,
    key: ServiceAccountKey,
}

impl ServiceAccountCredential {
    pub fn new(name: ServiceAccountName, key: ServiceAccountKey) -> Self {
        Self { name, key }
    }

    pub fn name(&self) -> &ServiceAccountName {
        &self.name
    }

    pub fn key(&self) -> &ServiceAccountKey {
        &self.key
    }

    /// Base64 of `{"name", "key", "not_before", "not_after"}`
    pub fn encode(&self) -> Result<String, CredentialError> {
        let document = EncodedCredential {
            name: self.name.name().to_string(),
            key: self.key.private_key_pem.clone(),
            not_before: self.key.not_before,
            not_after: self.key.not_after,
        };

        let json = serde_json::to_vec(&document)
            .map_err(|e| CredentialError::Decode(format!("failed to serialize: {}", e)))?;

        Ok(STANDARD.encode(json))
    }

    pub fn decode(value: &str) -> Result<Self, CredentialError> {
        Self::decode_at(value, Utc::now())
    }

    /// Decode and reject a key whose validity window has ended by `now`
    pub fn decode_at(value: &str, now: DateTime<Utc>) -> Result<Self, CredentialError> {
        let json = STANDARD
            .decode(value.trim())
            .map_err(|e| CredentialError::Decode(format!("invalid base64: {}", e)))?;

        let document: EncodedCredential = serde_json::from_slice(&json)
            .map_err(|e| CredentialError::Decode(format!("invalid document: {}", e)))?;

        let name = ServiceAccountName::parse(&document.name)?;

        let key_pair = KeyPair::from_pem(&document.key)
            .map_err(|e| CredentialError::Decode(format!("invalid signing key: {}", e)))?;

        if key_pair.algorithm() != &rcgen::PKCS_ECDSA_P256_SHA256 {
            return Err(CredentialError::Decode(
                "signing key must be ECDSA P-256".to_string(),
            ));
        }

        if document.not_before > document.not_after {
            return Err(CredentialError::Decode(
                "validity window ends before it starts".to_string(),
            ));
        }

        let key = ServiceAccountKey::from_key_pair(&key_pair, document.not_before, document.not_after);

        if key.is_expired_at(now) {
            return Err(CredentialError::Expired {
                name: name.full_id(),
                not_after: key.not_after,
            });
        }

        Ok(Self { name, key })
    }
}

/// An identity as registered with the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub role: String,
    pub key_ids: Vec<String>,
}

/// Control-plane store of service account identities
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    /// Look up an identity; `Ok(None)` when none is registered under `name`
    async fn find(&self, name: &ServiceAccountName) -> Result<Option<Identity>, Status>;

    async fn create(
        &self,
        name: &ServiceAccountName,
        public_key_pem: &str,
        role: &str,
    ) -> Result<(), Status>;

    async fn destroy(&self, name: &ServiceAccountName) -> Result<(), Status>;
}

/// Make `public_key_pem` the only key registered for `name`
///
/// Any existing identity is destroyed first, then a new one is created. `cancel`
/// is only honoured up to the destroy; from then on destroy and create run to
/// completion so an identity is never left half-replaced. A failed create after a
/// successful destroy is reported as [`CredentialError::IdentityLost`].
pub async fn ensure_exclusive_identity(
    registry: &dyn IdentityRegistry,
    name: &ServiceAccountName,
    public_key_pem: &str,
    role: &str,
    cancel: &CancellationToken,
) -> Result<(), CredentialError> {
    let lookup = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CredentialError::Cancelled),
        result = registry.find(name) => result,
    };

    let existing = match lookup {
        Ok(identity) => identity,
        Err(status) if status.code() == Code::NotFound => None,
        Err(status) => return Err(CredentialError::Remote(status)),
    };

    if cancel.is_cancelled() {
        return Err(CredentialError::Cancelled);
    }

    let destroyed = if existing.is_some() {
        info!(identity = %name, "Destroying existing service account");
        registry
            .destroy(name)
            .await
            .map_err(CredentialError::Remote)?;
        true
    } else {
        debug!(identity = %name, "No existing service account");
        false
    };

    registry
        .create(name, public_key_pem, role)
        .await
        .map_err(|source| {
            if destroyed {
                CredentialError::IdentityLost {
                    name: name.full_id(),
                    source,
                }
            } else {
                CredentialError::Remote(source)
            }
        })?;

    if cancel.is_cancelled() {
        warn!(identity = %name, "Shutdown requested while the service account was being replaced");
    }

    info!(identity = %name, role, "Service account created");
    Ok(())
}

/// Produces the credential the upstream connection authenticates with
pub struct CredentialProvisioner {
    config: Config,
}

impl CredentialProvisioner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Decode the supplied credential, or bootstrap a new identity
    ///
    /// A supplied credential is decoded without touching the network. Bootstrap
    /// stops early when `cancel` fires before the existing identity is destroyed.
    pub async fn obtain_credential(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ServiceAccountCredential, CredentialError> {
        if let Some(encoded) = &self.config.service_account.key {
            let credential = ServiceAccountCredential::decode(encoded)?;
            info!(
                identity = %credential.name(),
                not_after = %credential.key().not_after(),
                "Using supplied service account"
            );
            return Ok(credential);
        }

        if self.config.service_account.admin_token.is_none() {
            warn!("No service account supplied and no admin token configured; bootstrapping over an unauthenticated connection");
        }

        if cancel.is_cancelled() {
            return Err(CredentialError::Cancelled);
        }

        let registry = GrpcIdentityRegistry::connect(
            &self.config.upstream,
            self.config.service_account.admin_token.as_deref(),
        )?;

        self.bootstrap(&registry, cancel).await
    }

    /// Mint a key and register it as the only identity of the configured name
    pub async fn bootstrap(
        &self,
        registry: &dyn IdentityRegistry,
        cancel: &CancellationToken,
    ) -> Result<ServiceAccountCredential, CredentialError> {
        let account = &self.config.service_account;
        let name = ServiceAccountName::parse(&account.name)?;

        let key = ServiceAccountKey::generate(account.key_lifetime())?;
        let credential = ServiceAccountCredential::new(name, key);

        // Every local step has to succeed before anything is destroyed remotely
        credential.encode()?;
        crate::interceptor::BearerAuthInterceptor::new(&credential)?;

        ensure_exclusive_identity(
            registry,
            credential.name(),
            credential.key().public_key_pem(),
            &account.role,
            cancel,
        )
        .await?;

        Ok(credential)
    }
}

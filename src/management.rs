//! Service account registry backed by the control plane management service

use async_trait::async_trait;
use tonic::{Request, Status};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::connection::{Connection, ConnectionFactory, TlsOptions};
use crate::credentials::{CredentialError, Identity, IdentityRegistry, ServiceAccountName};
use crate::interceptor::{InterceptorChain, StaticTokenInterceptor};

const LIST_SERVICE_ACCOUNTS: &str = "/management.ManagementService/ListServiceAccounts";
const CREATE_SERVICE_ACCOUNT: &str = "/management.ManagementService/CreateServiceAccount";
const DESTROY_SERVICE_ACCOUNT: &str = "/management.ManagementService/DestroyServiceAccount";

/// `google.protobuf.Empty`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PublicKey {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub armored: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceAccount {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub pgp_public_keys: Vec<PublicKey>,
    #[prost(string, tag = "3")]
    pub role: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListServiceAccountsResponse {
    #[prost(message, repeated, tag = "1")]
    pub service_accounts: Vec<ServiceAccount>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateServiceAccountRequest {
    #[prost(string, tag = "1")]
    pub armored_pgp_public_key: String,
    #[prost(bool, tag = "2")]
    pub use_user_role: bool,
    #[prost(string, tag = "3")]
    pub role: String,
    #[prost(string, tag = "4")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateServiceAccountResponse {
    #[prost(string, tag = "1")]
    pub public_key_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DestroyServiceAccountRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

/// [`IdentityRegistry`] over `management.ManagementService`
pub struct GrpcIdentityRegistry {
    connection: Connection,
}

impl GrpcIdentityRegistry {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Open the administrative connection used for bootstrap
    ///
    /// No service account is attached; `admin_token`, when present, is sent as a
    /// static bearer token.
    pub fn connect(
        upstream: &UpstreamConfig,
        admin_token: Option<&str>,
    ) -> Result<Self, CredentialError> {
        let mut interceptors = InterceptorChain::new();
        if let Some(token) = admin_token {
            interceptors = interceptors.with(StaticTokenInterceptor::new(token)?);
        }

        let config = ConnectionFactory::build_config(
            &upstream.endpoint,
            None,
            interceptors,
            &TlsOptions::from(upstream),
        )?;
        let connection = ConnectionFactory::connect(&config)?;

        debug!(upstream = %connection.target(), "Administrative connection configured");
        Ok(Self::new(connection))
    }
}

#[async_trait]
impl IdentityRegistry for GrpcIdentityRegistry {
    async fn find(&self, name: &ServiceAccountName) -> Result<Option<Identity>, Status> {
        let response: ListServiceAccountsResponse = self
            .connection
            .unary(LIST_SERVICE_ACCOUNTS, Request::new(Empty {}))
            .await?
            .into_inner();

        Ok(response
            .service_accounts
            .into_iter()
            .find(|account| {
                ServiceAccountName::parse(&account.name)
                    .map(|parsed| &parsed == name)
                    .unwrap_or(false)
            })
            .map(|account| Identity {
                name: account.name,
                role: account.role,
                key_ids: account.pgp_public_keys.into_iter().map(|k| k.id).collect(),
            }))
    }

    async fn create(
        &self,
        name: &ServiceAccountName,
        public_key_pem: &str,
        role: &str,
    ) -> Result<(), Status> {
        let request = CreateServiceAccountRequest {
            armored_pgp_public_key: public_key_pem.to_string(),
            use_user_role: false,
            role: role.to_string(),
            name: name.name().to_string(),
        };

        let response: CreateServiceAccountResponse = self
            .connection
            .unary(CREATE_SERVICE_ACCOUNT, Request::new(request))
            .await?
            .into_inner();

        debug!(identity = %name, key_id = %response.public_key_id, "Public key registered");
        Ok(())
    }

    async fn destroy(&self, name: &ServiceAccountName) -> Result<(), Status> {
        let request = DestroyServiceAccountRequest {
            name: name.name().to_string(),
        };

        let _: Empty = self
            .connection
            .unary(DESTROY_SERVICE_ACCOUNT, Request::new(request))
            .await?
            .into_inner();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_create_request_wire_format() {
        let request = CreateServiceAccountRequest {
            armored_pgp_public_key: "k".to_string(),
            use_user_role: false,
            role: "Admin".to_string(),
            name: "omni-inspector".to_string(),
        };

        let bytes = request.encode_to_vec();
        // field 1 (string "k"), field 3 (string "Admin"), field 4; bool false is omitted
        assert_eq!(&bytes[..3], &[0x0a, 0x01, b'k']);
        assert_eq!(bytes[3], 0x1a);
        assert_eq!(
            CreateServiceAccountRequest::decode(bytes.as_slice()).unwrap(),
            request
        );
    }

    #[test]
    fn test_connect_with_admin_token() {
        let upstream = UpstreamConfig {
            endpoint: "grpc://127.0.0.1:9".to_string(),
            ..UpstreamConfig::default()
        };

        let registry = GrpcIdentityRegistry::connect(&upstream, Some("bootstrap")).unwrap();
        assert_eq!(registry.connection.target(), "127.0.0.1:9");
    }

    #[test]
    fn test_connect_rejects_bad_endpoint() {
        let upstream = UpstreamConfig {
            endpoint: "ftp://127.0.0.1".to_string(),
            ..UpstreamConfig::default()
        };

        assert!(matches!(
            GrpcIdentityRegistry::connect(&upstream, None),
            Err(CredentialError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_unavailable() {
        // nothing listens on the discard port
        let upstream = UpstreamConfig {
            endpoint: "grpc://127.0.0.1:9".to_string(),
            ..UpstreamConfig::default()
        };
        let registry = GrpcIdentityRegistry::connect(&upstream, None).unwrap();
        let name = ServiceAccountName::parse("omni-inspector").unwrap();

        let status = registry.find(&name).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}

//! Splits traffic between the JSON API and the static frontend

use async_trait::async_trait;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode, Uri};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tonic::Code;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::json_error_response;
use crate::static_files::StaticHandler;
use crate::ResponseBody;

/// Requests under this prefix are handed to the API handler
pub const API_PREFIX: &str = "/api/";

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

/// Largest API request body accepted
pub const MAX_API_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// API call; `path` has `/api` removed and keeps the query string
    Api { path: String },
    /// Frontend asset, served with fallback to `index.html`; this includes a bare `/api`
    Static { path: String },
}

impl RouteDecision {
    pub fn from_uri(uri: &Uri) -> Self {
        let path = uri.path();

        match path.strip_prefix("/api") {
            Some(rest) if path.starts_with(API_PREFIX) => {
                let path = match uri.query() {
                    Some(query) => format!("{}?{}", rest, query),
                    None => rest.to_string(),
                };
                RouteDecision::Api { path }
            }
            _ => RouteDecision::Static {
                path: path.to_string(),
            },
        }
    }
}

/// Handles requests routed to the API surface
#[async_trait]
pub trait ApiHandler: Send + Sync {
    /// `request` carries the stripped URI and the fully read body
    async fn handle(&self, request: Request<Bytes>) -> Response<ResponseBody>;
}

pub struct Router {
    api: Arc<dyn ApiHandler>,
    assets: Arc<StaticHandler>,
}

impl Router {
    pub fn new(api: Arc<dyn ApiHandler>, assets: Arc<StaticHandler>) -> Self {
        Self { api, assets }
    }

    /// Route one request and write its access log line
    pub async fn handle<B>(&self, mut req: Request<B>) -> Result<Response<ResponseBody>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(X_REQUEST_ID, value);
        }

        let mut response = self.route(req).await;

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        info!(
            method = %method,
            uri = %uri,
            duration_ms = start.elapsed().as_millis() as u64,
            status = response.status().as_u16(),
            request_id = %request_id,
            "Request completed"
        );

        Ok(response)
    }

    async fn route<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match RouteDecision::from_uri(req.uri()) {
            RouteDecision::Api { path } => {
                let (mut parts, body) = req.into_parts();

                parts.uri = match path.parse() {
                    Ok(uri) => uri,
                    Err(_) => {
                        return json_error_response(
                            StatusCode::BAD_REQUEST,
                            Code::InvalidArgument,
                            "invalid request path",
                        )
                    }
                };

                let body = match Limited::new(body, MAX_API_BODY_SIZE).collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        debug!(error = %e, "Failed to read API request body");
                        return if e.is::<http_body_util::LengthLimitError>() {
                            json_error_response(
                                StatusCode::PAYLOAD_TOO_LARGE,
                                Code::ResourceExhausted,
                                "request body too large",
                            )
                        } else {
                            json_error_response(
                                StatusCode::BAD_REQUEST,
                                Code::InvalidArgument,
                                "failed to read request body",
                            )
                        };
                    }
                };

                self.api.handle(Request::from_parts(parts, body)).await
            }
            RouteDecision::Static { path } => {
                self.assets.serve(req.method(), &path, req.headers()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetStore;
    use crate::full;
    use http_body_util::Full;
    use hyper::Method;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String, Bytes)>>,
    }

    #[async_trait]
    impl ApiHandler for Recorder {
        async fn handle(&self, request: Request<Bytes>) -> Response<ResponseBody> {
            let request_id = request
                .headers()
                .get(X_REQUEST_ID)
                .map(|v| v.to_str().unwrap().to_string())
                .unwrap_or_default();
            self.seen.lock().unwrap().push((
                request.uri().to_string(),
                request_id,
                request.body().clone(),
            ));
            Response::new(full("{}"))
        }
    }

    fn router() -> (Router, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let assets = StaticHandler::new(
            AssetStore::from_entries([("index.html", "<html>shell</html>"), ("app.js", "js")]),
            7200,
        );
        (
            Router::new(recorder.clone(), Arc::new(assets)),
            recorder,
        )
    }

    fn request(method: Method, uri: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[test]
    fn test_route_decision() {
        let decide = |uri: &str| RouteDecision::from_uri(&uri.parse().unwrap());

        assert_eq!(
            decide("/api/resources/Foo"),
            RouteDecision::Api {
                path: "/resources/Foo".to_string()
            }
        );
        assert_eq!(
            decide("/api/omni.resources.ResourceService/List?limit=5"),
            RouteDecision::Api {
                path: "/omni.resources.ResourceService/List?limit=5".to_string()
            }
        );
        assert_eq!(
            decide("/api/"),
            RouteDecision::Api {
                path: "/".to_string()
            }
        );
        // Only the `/api/` prefix is the API surface; a bare `/api` is a frontend route
        assert_eq!(
            decide("/api"),
            RouteDecision::Static {
                path: "/api".to_string()
            }
        );
        assert_eq!(
            decide("/api?x=1"),
            RouteDecision::Static {
                path: "/api".to_string()
            }
        );
        assert_eq!(
            decide("/apis/x"),
            RouteDecision::Static {
                path: "/apis/x".to_string()
            }
        );
        assert_eq!(
            decide("/dashboard/unknown-route?tab=1"),
            RouteDecision::Static {
                path: "/dashboard/unknown-route".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_api_requests_are_stripped() {
        let (router, recorder) = router();

        let response = router
            .handle(request(Method::POST, "/api/resources/Foo?x=1", "{\"id\":\"a\"}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "/resources/Foo?x=1");
        assert_eq!(seen[0].2, Bytes::from_static(b"{\"id\":\"a\"}"));
    }

    #[tokio::test]
    async fn test_request_id_is_forwarded_and_returned() {
        let (router, recorder) = router();

        let mut req = request(Method::POST, "/api/resources/Foo", "");
        req.headers_mut()
            .insert(X_REQUEST_ID, HeaderValue::from_static("req-42"));
        let response = router.handle(req).await.unwrap();

        assert_eq!(response.headers()[X_REQUEST_ID], "req-42");
        assert_eq!(recorder.seen.lock().unwrap()[0].1, "req-42");
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let (router, _) = router();

        let response = router
            .handle(request(Method::GET, "/app.js", ""))
            .await
            .unwrap();

        let id = response.headers()[X_REQUEST_ID].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_static_requests_bypass_api() {
        let (router, recorder) = router();

        let response = router
            .handle(request(Method::GET, "/dashboard/unknown-route", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-frame-options"], "SAMEORIGIN");
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}

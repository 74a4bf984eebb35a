//! Integration tests for omni-inspector

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use omni_inspector::config::Config;
use omni_inspector::credentials::{ServiceAccountCredential, ServiceAccountKey, ServiceAccountName};
use omni_inspector::lifecycle;
use prost::Message;
use prost_reflect::prost_types::{
    field_descriptor_proto::{Label, Type},
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Requests seen by the fake upstream: (path, headers)
type Seen = Arc<Mutex<Vec<(String, HeaderMap)>>>;

/// A running gateway and everything it was started with
struct Gateway {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), omni_inspector::server::ShutdownError>>,
    _dir: TempDir,
}

fn supplied_credential() -> String {
    let key = ServiceAccountKey::generate(chrono::Duration::days(1)).unwrap();
    let name = ServiceAccountName::parse("omni-inspector").unwrap();
    ServiceAccountCredential::new(name, key).encode().unwrap()
}

fn text_field(name: &str, number: i32, kind: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(kind as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    }
}

/// `inspector.test.EchoService/Echo(Note) returns (Note)`
fn write_descriptor_set(path: &Path) {
    let set = FileDescriptorSet {
        file: vec![FileDescriptorProto {
            name: Some("inspector/echo.proto".to_string()),
            package: Some("inspector.test".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("Note".to_string()),
                field: vec![
                    text_field("text", 1, Type::String),
                    text_field("count", 2, Type::Int32),
                ],
                ..Default::default()
            }],
            service: vec![ServiceDescriptorProto {
                name: Some("EchoService".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("Echo".to_string()),
                    input_type: Some(".inspector.test.Note".to_string()),
                    output_type: Some(".inspector.test.Note".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }],
    };

    std::fs::write(path, set.encode_to_vec()).unwrap();
}

/// Answer every gRPC call by echoing the request frame back
async fn echo(
    req: Request<Incoming>,
    seen: Seen,
) -> Result<Response<UnsyncBoxBody<Bytes, Infallible>>, Infallible> {
    let (parts, body) = req.into_parts();
    seen.lock()
        .unwrap()
        .push((parts.uri.path().to_string(), parts.headers.clone()));

    let frame = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from_static("0"));

    let mut builder = Response::builder()
        .header("content-type", "application/grpc")
        .header("x-upstream", "echo");
    if let Some(encoding) = parts.headers.get("grpc-encoding") {
        builder = builder.header("grpc-encoding", encoding.clone());
    }

    let body = Full::new(frame)
        .with_trailers(async move { Some(Ok(trailers)) })
        .boxed_unsync();
    Ok(builder.body(body).unwrap())
}

/// Start a plaintext HTTP/2 server that echoes every unary call
async fn start_upstream() -> (SocketAddr, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));

    let recorded = seen.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = recorded.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| echo(req, seen.clone()));
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, seen)
}

/// Start the gateway against `endpoint` with a small frontend bundle
async fn start_gateway(endpoint: &str) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let dist = dir.path().join("dist");
    std::fs::create_dir_all(dist.join("assets")).unwrap();
    std::fs::write(dist.join("index.html"), "<html>inspector</html>").unwrap();
    std::fs::write(dist.join("assets/app.3f9a.js"), "console.log('app')").unwrap();

    let descriptor_set = dir.path().join("api.binpb");
    write_descriptor_set(&descriptor_set);

    let mut config = Config::default();
    config.server.bind = "127.0.0.1:0".to_string();
    config.server.shutdown_timeout_secs = 5;
    config.upstream.endpoint = endpoint.to_string();
    config.upstream.descriptor_set = Some(descriptor_set);
    config.service_account.key = Some(supplied_credential());
    config.frontend.dist_dir = dist;

    let cancel = CancellationToken::new();
    let server = lifecycle::start(config, &cancel).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run(cancel.clone()));

    Gateway {
        addr,
        cancel,
        handle,
        _dir: dir,
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);

    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

async fn http_get(addr: SocketAddr, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(addr, "GET", path, &[], "").await
}

fn response_body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

#[tokio::test]
async fn test_spa_fallback_serves_shell() {
    let gateway = start_gateway("grpc://127.0.0.1:9").await;

    let response = http_get(gateway.addr, "/clusters/talos-1/machines").await.unwrap();
    let lower = response.to_lowercase();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert_eq!(response_body(&response), "<html>inspector</html>");
    assert!(lower.contains("x-frame-options: sameorigin"));
    assert!(lower.contains("content-security-policy: default-src 'self'"));
    assert!(lower.contains("x-request-id: "));
    assert!(!lower.contains("immutable"));

    gateway.cancel.cancel();
}

#[tokio::test]
async fn test_asset_is_cacheable() {
    let gateway = start_gateway("grpc://127.0.0.1:9").await;

    let response = http_get(gateway.addr, "/assets/app.3f9a.js").await.unwrap();
    let lower = response.to_lowercase();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert_eq!(response_body(&response), "console.log('app')");
    assert!(lower.contains("cache-control: public, max-age="));
    assert!(lower.contains("etag: \""));
    assert!(lower.contains("last-modified: "));
    assert!(!lower.contains("x-frame-options"));

    gateway.cancel.cancel();
}

#[tokio::test]
async fn test_static_surface_is_read_only() {
    let gateway = start_gateway("grpc://127.0.0.1:9").await;

    let response = http_request(gateway.addr, "OPTIONS", "/", &[], "").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.to_lowercase().contains("allow: options, get, head"));

    let response = http_request(gateway.addr, "DELETE", "/index.html", &[], "")
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 405"), "{}", response);
    assert_eq!(response_body(&response), "read-only\n");

    gateway.cancel.cancel();
}

#[tokio::test]
async fn test_api_call_reaches_upstream() {
    let (upstream, seen) = start_upstream().await;
    let gateway = start_gateway(&format!("grpc://{}", upstream)).await;

    let response = http_request(
        gateway.addr,
        "POST",
        "/api/inspector.test.EchoService/Echo",
        &[
            ("Content-Type", "application/json"),
            ("X-Request-Id", "req-7"),
            ("Grpc-Metadata-Tenant", "acme"),
        ],
        r#"{"text":"hello","count":3}"#,
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    let lower = response.to_lowercase();
    assert!(lower.contains("x-request-id: req-7"));
    assert!(lower.contains("grpc-metadata-x-upstream: echo"));

    let body: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["text"], "hello");
    assert_eq!(body["count"], 3);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (path, headers) = &seen[0];
    assert_eq!(path, "/inspector.test.EchoService/Echo");
    assert!(headers["authorization"]
        .to_str()
        .unwrap()
        .starts_with("Bearer "));
    assert_eq!(headers["tenant"], "acme");
    assert_eq!(headers["x-request-id"], "req-7");

    drop(seen);
    gateway.cancel.cancel();
}

#[tokio::test]
async fn test_api_unknown_method() {
    let gateway = start_gateway("grpc://127.0.0.1:9").await;

    let response = http_request(gateway.addr, "POST", "/api/resources/Foo", &[], "{}")
        .await
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    assert!(response.to_lowercase().contains("x-gateway-error: not_found"));
    let body: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["code"], 5);
    assert_eq!(body["details"], serde_json::json!([]));

    gateway.cancel.cancel();
}

#[tokio::test]
async fn test_api_upstream_unavailable() {
    // nothing listens on the discard port
    let gateway = start_gateway("grpc://127.0.0.1:9").await;

    let response = http_request(
        gateway.addr,
        "POST",
        "/api/inspector.test.EchoService/Echo",
        &[],
        r#"{"text":"hello"}"#,
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
    assert!(response.to_lowercase().contains("x-gateway-error: unavailable"));

    gateway.cancel.cancel();
}

#[tokio::test]
async fn test_api_rejects_malformed_json() {
    let gateway = start_gateway("grpc://127.0.0.1:9").await;

    let response = http_request(
        gateway.addr,
        "POST",
        "/api/inspector.test.EchoService/Echo",
        &[],
        r#"{"text":"#,
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
    assert!(response.to_lowercase().contains("x-gateway-error: invalid_argument"));

    gateway.cancel.cancel();
}

#[tokio::test]
async fn test_graceful_shutdown() {
    let gateway = start_gateway("grpc://127.0.0.1:9").await;
    assert!(http_get(gateway.addr, "/").await.is_ok());

    gateway.cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), gateway.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    assert!(TcpStream::connect(gateway.addr).await.is_err());
}

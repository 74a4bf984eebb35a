//! Static frontend handler with SPA fallback
//!
//! Every GET/HEAD path is tried literally first and then as `/index.html`, so
//! client-side routes always receive the application shell. Fingerprinted assets
//! get long-lived caching headers; the shell gets the security header bundle.
//! All assets share one modification time, taken when the handler is created.

use chrono::{DateTime, Timelike, Utc};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::path::Path;
use tracing::{debug, warn};

use crate::assets::{Asset, AssetError, AssetStore};
use crate::{empty, full, ResponseBody};

/// Application shell served for every unknown path
pub const INDEX: &str = "/index.html";

/// Methods accepted by the handler
pub const ALLOWED_METHODS: &str = "OPTIONS, GET, HEAD";

const REFERRER_POLICY: &str = "strict-origin-when-cross-origin";

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; img-src * data: ; \
;connect-src 'self' https://*.auth0.com ;font-src 'self' data: \
;style-src 'self' 'unsafe-inline' https://fonts.googleapis.com data: ;upgrade-insecure-requests;\
;frame-src https://*.auth0.com";

const PERMISSIONS_POLICY: &str = "accelerometer=(), ambient-light-sensor=(), \
autoplay=(self), battery=(), camera=(), cross-origin-isolated=(self), display-capture=(), \
document-domain=(), encrypted-media=(), fullscreen=(self), geolocation=(), gyroscope=(), \
magnetometer=(), microphone=(), midi=(), payment=(), picture-in-picture=(), publickey-credentials=(self),\
screen-wake-lock=(), sync-xhr=(self), usb=(), web-share=(), xr-spatial-tracking=()";

/// Serves the frontend bundle
pub struct StaticHandler {
    store: AssetStore,
    mod_time: DateTime<Utc>,
    cache_control: HeaderValue,
}

impl StaticHandler {
    pub fn new(store: AssetStore, max_age_secs: u64) -> Self {
        let now = Utc::now();
        let cache_control = HeaderValue::from_str(&format!(
            "public, max-age={}, immutable",
            max_age_secs
        ))
        .expect("cache-control value is ASCII");

        Self {
            store,
            mod_time: now.with_nanosecond(0).unwrap_or(now),
            cache_control,
        }
    }

    /// Override the shared modification time
    pub fn with_mod_time(mut self, mod_time: DateTime<Utc>) -> Self {
        self.mod_time = mod_time.with_nanosecond(0).unwrap_or(mod_time);
        self
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.mod_time
    }

    pub async fn serve(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Response<ResponseBody> {
        match *method {
            Method::GET | Method::HEAD => {
                // Decoded before cleaning, so an encoded `..` is still confined to the root
                let decoded = percent_decode_str(path).decode_utf8_lossy();
                let path = if decoded.starts_with('/') {
                    decoded.into_owned()
                } else {
                    format!("/{}", decoded)
                };

                self.serve_file(method, &path, headers).await
            }
            Method::OPTIONS => {
                let mut response = Response::new(empty());
                response
                    .headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
                response
            }
            _ => {
                let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "read-only");
                response
                    .headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
                response
            }
        }
    }

    async fn serve_file(
        &self,
        method: &Method,
        name: &str,
        headers: &HeaderMap,
    ) -> Response<ResponseBody> {
        for candidate in [name, INDEX] {
            let asset = match self.store.open(candidate).await {
                Ok(asset) => asset,
                Err(AssetError::NotFound) => continue,
                Err(e) => return error_response(&e),
            };

            let policy = if asset.name() == INDEX {
                if candidate != name {
                    debug!(path = name, "Serving application shell for unknown path");
                }
                security_headers()
            } else {
                self.caching_headers()
            };

            return self.serve_content(method, headers, &asset, policy);
        }

        error_response(&AssetError::NotFound)
    }

    fn caching_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::VARY,
            HeaderValue::from_static("Accept-Encoding, User-Agent"),
        );
        headers.insert(header::CACHE_CONTROL, self.cache_control.clone());
        headers
    }

    fn serve_content(
        &self,
        method: &Method,
        request_headers: &HeaderMap,
        asset: &Asset,
        mut headers: HeaderMap,
    ) -> Response<ResponseBody> {
        let etag = asset.etag();
        let last_modified = http_date(self.mod_time);

        if let Ok(value) = HeaderValue::from_str(etag) {
            headers.insert(header::ETAG, value);
        }
        if let Ok(value) = HeaderValue::from_str(&last_modified) {
            headers.insert(header::LAST_MODIFIED, value);
        }

        if self.is_not_modified(request_headers, etag) {
            return build_response(StatusCode::NOT_MODIFIED, headers, empty());
        }

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(asset.name())));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        let size = asset.size();
        let range = request_headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, size));

        let (status, body) = match range {
            None => (StatusCode::OK, asset.content().clone()),
            Some(Ok((start, end))) => {
                let content_range = format!("bytes {}-{}/{}", start, end, size);
                if let Ok(value) = HeaderValue::from_str(&content_range) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (
                    StatusCode::PARTIAL_CONTENT,
                    asset.content().slice(start as usize..=end as usize),
                )
            }
            Some(Err(())) => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                headers.remove(header::CONTENT_TYPE);
                let mut response =
                    text_response(StatusCode::RANGE_NOT_SATISFIABLE, "invalid range: failed to overlap");
                for (name, value) in headers.iter() {
                    response.headers_mut().insert(name.clone(), value.clone());
                }
                return response;
            }
        };

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));

        let body = if method == Method::HEAD {
            empty()
        } else {
            full(body)
        };

        build_response(status, headers, body)
    }

    fn is_not_modified(&self, request_headers: &HeaderMap, etag: &str) -> bool {
        if let Some(if_none_match) = request_headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
        {
            return etag_matches(if_none_match, etag);
        }

        request_headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date)
            .map(|since| self.mod_time <= since)
            .unwrap_or(false)
    }
}

fn security_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static(REFERRER_POLICY),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static(PERMISSIONS_POLICY),
    );
    headers
}

fn build_response(
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn text_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    build_response(status, headers, full(format!("{}\n", message)))
}

/// Fixed-phrase error response; details stay in the log
fn error_response(err: &AssetError) -> Response<ResponseBody> {
    match err {
        AssetError::NotFound => text_response(StatusCode::NOT_FOUND, "404 Page Not Found"),
        AssetError::Permission => {
            warn!(error = %err, "Frontend asset is not readable");
            text_response(StatusCode::FORBIDDEN, "403 Forbidden")
        }
        AssetError::Io(_) => {
            warn!(error = %err, "Failed to open frontend asset");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error")
        }
    }
}

/// Weak comparison against an If-None-Match list
fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let etag = etag.trim_start_matches("W/");
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == etag
    })
}

/// Format as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Parse a single `bytes=` range against `size`
///
/// `None` means the header is ignored and the whole asset is served (unknown unit,
/// multiple ranges). `Some(Err(()))` means the range cannot be satisfied.
fn parse_range(value: &str, size: u64) -> Option<Result<(u64, u64), ()>> {
    let range = value.trim().strip_prefix("bytes=")?.trim();
    if range.contains(',') {
        return None;
    }

    let (start, end) = range.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let suffix: u64 = match end.parse() {
            Ok(suffix) => suffix,
            Err(_) => return Some(Err(())),
        };
        if suffix == 0 || size == 0 {
            return Some(Err(()));
        }
        return Some(Ok((size.saturating_sub(suffix), size - 1)));
    }

    let start: u64 = match start.parse() {
        Ok(start) => start,
        Err(_) => return Some(Err(())),
    };
    if start >= size {
        return Some(Err(()));
    }

    let end = if end.is_empty() {
        size - 1
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => end.min(size - 1),
            _ => return Some(Err(())),
        }
    };

    Some(Ok((start, end)))
}

fn content_type(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("ico") => "image/vnd.microsoft.icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "text/xml; charset=utf-8",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

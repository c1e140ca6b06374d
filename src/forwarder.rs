//! Outbound request forwarding
//!
//! One pooled HTTP client is shared by every request-handling task. It
//! never follows redirects (the backend's redirect goes back to the
//! caller verbatim) and never verifies backend certificates; origins sit
//! on trusted networks with self-signed or internal certificates.
//!
//! Header copying collapses multi-valued headers into one comma-joined
//! value in both directions and stamps the forwarding marker onto every
//! outbound request. Backend failures map onto fixed client responses:
//! construction and transport failures become 400, a relay failure after
//! a successful exchange becomes 500.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

/// Marker header appended to every proxied request.
pub const FORWARDED_BY: &str = "SillyProxy";

/// TCP connect deadline for new backend connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keepalive interval on backend connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Deadline for the whole exchange: dispatch, headers and body.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle pooled connections kept per backend host.
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Headers never copied onto the outbound request: the client computes
/// its own message framing, and the Host header comes from the target
/// URL.
const SKIPPED_REQUEST_HEADERS: [&str; 3] = ["host", "content-length", "transfer-encoding"];

/// Headers never relayed from the backend response. The body is buffered
/// before relay, so the server recomputes framing for it.
const SKIPPED_RESPONSE_HEADERS: [&str; 1] = ["transfer-encoding"];

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// The shared outbound client.
pub struct Forwarder {
    client: HttpsClient,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    /// Build the pooled client with the fixed timeout profile.
    pub fn new() -> Self {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));
        http.set_keepalive(Some(TCP_KEEPALIVE));
        http.enforce_http(false);

        let tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(connector);

        Self { client }
    }

    /// Proxy one request to `target_url` and produce the client-facing
    /// response. Never returns an error; failures become the fixed 400 /
    /// 500 responses.
    pub async fn forward(
        &self,
        method: Method,
        target_url: &str,
        inbound_headers: &HeaderMap,
        body: Body,
    ) -> Response {
        let request = match outbound_request(method, target_url, inbound_headers, body) {
            Ok(r) => r,
            Err(e) => {
                warn!(target = target_url, error = %e, "failed to construct outbound request");
                return error_response(StatusCode::BAD_REQUEST);
            }
        };

        let exchange = tokio::time::timeout(REQUEST_TIMEOUT, async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(ExchangeError::Transport)?;
            let (parts, body) = response.into_parts();
            let bytes = body
                .collect()
                .await
                .map(http_body_util::Collected::to_bytes)
                .map_err(ExchangeError::Relay)?;
            Ok::<_, ExchangeError>((parts, bytes))
        })
        .await;

        let (parts, bytes) = match exchange {
            Ok(Ok(done)) => done,
            Ok(Err(ExchangeError::Transport(e))) => {
                warn!(target = target_url, error = %e, "error obtaining response from backend");
                return error_response(StatusCode::BAD_REQUEST);
            }
            Ok(Err(ExchangeError::Relay(e))) => {
                warn!(target = target_url, error = %e, "failed reading backend response body");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
            Err(_) => {
                warn!(target = target_url, "backend request timed out");
                return error_response(StatusCode::BAD_REQUEST);
            }
        };

        debug!(
            target = target_url,
            status = parts.status.as_u16(),
            bytes = bytes.len(),
            "backend exchange complete"
        );

        let mut builder = http::Response::builder().status(parts.status);
        for (name, value) in collapse_headers(&parts.headers, &SKIPPED_RESPONSE_HEADERS) {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(bytes))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR))
    }
}

enum ExchangeError {
    Transport(hyper_util::client::legacy::Error),
    Relay(hyper::Error),
}

/// The fixed failure response shared by the 400 and 500 paths.
pub fn error_response(status: StatusCode) -> Response {
    (status, "Request Failed").into_response()
}

/// Assemble the outbound request: method and body reused, headers copied
/// comma-collapsed, forwarding marker appended last so it overrides any
/// inbound value.
fn outbound_request(
    method: Method,
    target_url: &str,
    inbound_headers: &HeaderMap,
    body: Body,
) -> Result<Request<Body>, http::Error> {
    let uri: Uri = target_url.parse()?;
    let mut request = Request::builder().method(method).uri(uri).body(body)?;

    let headers = request.headers_mut();
    for (name, value) in collapse_headers(inbound_headers, &SKIPPED_REQUEST_HEADERS) {
        headers.insert(name, value);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-by"),
        HeaderValue::from_static(FORWARDED_BY),
    );

    Ok(request)
}

/// Collapse a header map into `(name, comma-joined value)` pairs,
/// skipping the given lowercase names. Values that are not visible ASCII
/// are dropped; the wire never produced them from a conforming client.
fn collapse_headers(headers: &HeaderMap, skip: &[&str]) -> Vec<(HeaderName, HeaderValue)> {
    let mut out = Vec::with_capacity(headers.keys_len());
    for name in headers.keys() {
        if skip.contains(&name.as_str()) {
            continue;
        }
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        match HeaderValue::from_str(&joined) {
            Ok(value) => out.push((name.clone(), value)),
            Err(_) => debug!(header = %name, "dropping non-ASCII header value"),
        }
    }
    out
}

/// Backend certificate verifier that accepts everything. Origins sit on
/// trusted networks with internal certificates, so verification is off.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

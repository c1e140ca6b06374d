//! TLS listener and inbound request dispatch
//!
//! Binds the socket, terminates TLS with the per-handshake certificate
//! selector wired into rustls, and serves HTTP/1.1 over the decrypted
//! stream. Each accepted connection runs in its own task; the handshake
//! and request-header reads sit under fixed deadlines.
//!
//! Dispatch is two-level: the Host header (port stripped) picks the
//! virtual host's router, then method+path matching yields the route
//! whose template builds the backend URL.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Host, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, info, warn};

use crate::config::MinTlsVersion;
use crate::forwarder::{error_response, Forwarder};
use crate::routes::RouterTable;
use crate::selector::SniCertSelector;
use crate::template::build_target_url;

/// Deadline for the TLS handshake on a fresh connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for reading a request's header block.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a request handler needs, built once at startup.
pub struct ProxyContext {
    /// Compiled route table.
    pub table: RouterTable,
    /// Shared outbound client.
    pub forwarder: Forwarder,
}

/// Build the rustls server configuration around the certificate selector.
pub fn build_tls_config(
    selector: Arc<SniCertSelector>,
    min_tls: MinTlsVersion,
) -> Arc<rustls::ServerConfig> {
    if min_tls.is_clamped() {
        warn!(
            requested = min_tls.requested(),
            effective = min_tls.effective(),
            "requested TLS floor is below what the TLS backend supports; clamping"
        );
    }
    let mut config =
        rustls::ServerConfig::builder_with_protocol_versions(min_tls.protocol_versions())
            .with_no_client_auth()
            .with_cert_resolver(selector);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Assemble the inbound application: every request lands in the proxy
/// handler regardless of path.
pub fn app(ctx: Arc<ProxyContext>) -> Router {
    Router::new()
        .fallback(any(proxy_handler))
        .with_state(ctx)
}

/// Accept loop. Runs until the enclosing task is dropped at shutdown.
pub async fn run(
    addr: SocketAddr,
    tls_config: Arc<rustls::ServerConfig>,
    ctx: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(tls_config);
    let app = app(ctx);

    info!(addr = %addr, "TLS listener ready");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, acceptor, app).await;
        });
    }
}

/// Terminate TLS and serve HTTP/1.1 on one connection.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, acceptor: TlsAcceptor, app: Router) {
    let tls_stream = match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            // Selector misses surface here as handshake failures.
            debug!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "TLS handshake timed out");
            return;
        }
    };

    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
        let mut app = app.clone();
        async move { app.call(request).await }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    if let Err(e) = builder
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        debug!(peer = %peer, error = %e, "connection closed with error");
    }
}

/// Dispatch one decrypted request: host, then method+path, then forward.
async fn proxy_handler(
    State(ctx): State<Arc<ProxyContext>>,
    Host(host): Host,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(host_router) = ctx.table.host(&host) else {
        warn!(host = %host, "request for unregistered host");
        return (
            StatusCode::FORBIDDEN,
            format!(
                "Request Forbidden, this request for hostname: {host} is in error. \
                 Please check your input"
            ),
        )
            .into_response();
    };

    let path = uri.path();
    let Some(matched) = host_router.find(&method, path) else {
        debug!(host = %host, method = %method, path = %path, "no route matched");
        return (StatusCode::NOT_FOUND, "404 page not found").into_response();
    };

    let target = match build_target_url(&matched.route.template, &matched.bindings, uri.query()) {
        Ok(url) if !url.is_empty() => url,
        Ok(_) => {
            warn!(host = %host, path = %path, "route template produced an empty URL");
            return error_response(StatusCode::BAD_REQUEST);
        }
        Err(e) => {
            warn!(host = %host, path = %path, error = %e, "route template build failed");
            return error_response(StatusCode::BAD_REQUEST);
        }
    };

    ctx.forwarder.forward(method, &target, &headers, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{RouteSpec, RouterTable};
    use http::header::HOST;
    use tower::ServiceExt;

    fn test_ctx() -> Arc<ProxyContext> {
        let spec: RouteSpec = serde_json::from_str(
            r#"{"Routes":[{"Host":"example.com","MethodPathMaps":[
                {"Method":"GET","Path":"/broken/:p","Route":["http://b/", 5]}
            ]}]}"#,
        )
        .unwrap();
        Arc::new(ProxyContext {
            table: RouterTable::compile(&spec).unwrap(),
            forwarder: Forwarder::new(),
        })
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unknown_host_is_forbidden_with_fixed_body() {
        let app = app(test_ctx());
        let request = Request::builder()
            .uri("/anything")
            .header(HOST, "nope.invalid")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_string(response).await,
            "Request Forbidden, this request for hostname: nope.invalid is in error. \
             Please check your input"
        );
    }

    #[tokio::test]
    async fn host_header_port_is_stripped_for_lookup() {
        let app = app(test_ctx());
        let request = Request::builder()
            .uri("/no/such/route")
            .header(HOST, "example.com:8443")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        // Host resolved (not 403); the path then misses.
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found() {
        let app = app(test_ctx());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/broken/x")
            .header(HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn out_of_range_template_is_bad_request() {
        let app = app(test_ctx());
        let request = Request::builder()
            .uri("/broken/value")
            .header(HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Request Failed");
    }
}

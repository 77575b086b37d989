use std::{convert::Infallible, net::SocketAddr};

use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Bytes,
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::RuleCache;

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn serve_req<B>(req: &Request<B>, registry: &Registry, cache: &RuleCache) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return response(StatusCode::METHOD_NOT_ALLOWED, "");
    }
    match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut result = Vec::new();
            match encoder.encode(&metric_families, &mut result) {
                Ok(_) => {
                    let mut response = response(StatusCode::OK, result);
                    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
                        response.headers_mut().insert(CONTENT_TYPE, content_type);
                    }
                    response
                }
                Err(e) => {
                    error!("{}", e);
                    response(StatusCode::INTERNAL_SERVER_ERROR, "")
                }
            }
        }
        "/healthz" => response(StatusCode::OK, "Ok"),
        "/readyz" if cache.has_synced() => response(StatusCode::OK, "Ok"),
        "/readyz" => response(StatusCode::SERVICE_UNAVAILABLE, "cache not synced"),
        _ => response(StatusCode::NOT_FOUND, ""),
    }
}

/// Expose CPU, memory and file descriptor usage of this process on `registry`.
#[cfg(target_os = "linux")]
pub(crate) fn register_process_collector(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(
        prometheus::process_collector::ProcessCollector::for_self(),
    ))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn register_process_collector(_registry: &Registry) -> prometheus::Result<()> {
    Ok(())
}

/// Serve `/metrics`, `/healthz` and `/readyz` until `cancel` fires.
pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
    cache: RuleCache,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept metrics connection: {}", e);
                    continue;
                }
            },
        };
        let registry = registry.clone();
        let cache = cache.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = serve_req(&req, &registry, &cache);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection error: {}", e);
            }
        });
    }
}

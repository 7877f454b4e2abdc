//! HTTP/1.1 transport for the control API

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::ControlApi;

async fn respond(
    api: &ControlApi,
    request: Request<Incoming>,
    peer: SocketAddr,
) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();

    let reply = match body.collect().await {
        Ok(collected) => {
            api.handle(&parts.method, &parts.uri, peer, &collected.to_bytes())
                .await
        }
        Err(e) => {
            debug!("Failed to read request body from {}: {}", peer, e);
            super::ControlResponse::text(StatusCode::BAD_REQUEST, "Error: unreadable body")
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(reply.body)));
    *response.status_mut() = reply.status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(reply.content_type));
    response
}

/// Accept connections until the API's shutdown signal fires
pub async fn serve(listener: TcpListener, api: Arc<ControlApi>) -> std::io::Result<()> {
    let shutdown = api.shutdown_signal();
    info!("Control API listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.notified() => {
                info!("Control API shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    continue;
                }
            },
        };

        let api = api.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let api = api.clone();
                async move { Ok::<_, Infallible>(respond(&api, request, peer).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Control connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Bind the listener and serve on it
pub async fn run(listen: SocketAddr, api: Arc<ControlApi>) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    serve(listener, api).await
}

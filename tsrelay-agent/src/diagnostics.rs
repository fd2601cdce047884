//! A tiny HTTP endpoint exposing the pipeline statistics as JSON.
use std::{future::Future, io, net::SocketAddr, pin::Pin};

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::{self, HeaderValue},
    server::conn::http1::Builder as HyperHttpBuilder,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, warn};
use tsrelay::Pipeline;

pub type DiagnosticsFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Binds the diagnostics endpoint, returning the bound address and the future serving it.
///
/// Must be called from within a Tokio runtime.
pub fn serve(address: SocketAddr, pipeline: Pipeline) -> io::Result<(SocketAddr, DiagnosticsFuture)> {
    let listener = std::net::TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let local_address = listener.local_addr()?;

    let future = Box::pin(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Error accepting diagnostics connection.");
                    continue;
                }
            };

            let pipeline = pipeline.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let response = handle(&pipeline, &req);
                async move { Ok::<_, hyper::Error>(response) }
            });

            tokio::spawn(async move {
                if let Err(e) =
                    HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await
                {
                    debug!(error = %e, "Error serving diagnostics connection.");
                }
            });
        }
    });

    Ok((local_address, future))
}

fn handle<B>(pipeline: &Pipeline, req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return with_status(Response::new(Full::default()), StatusCode::METHOD_NOT_ALLOWED);
    }

    match serde_json::to_vec(&pipeline.stats()) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!(error = %e, "Failed to serialize pipeline statistics.");
            with_status(Response::new(Full::default()), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn with_status<B>(mut response: Response<B>, status: StatusCode) -> Response<B> {
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http_body_util::BodyExt;
    use hyper::{body::Bytes, header, Method, Request, StatusCode};
    use tsrelay::{Pipeline, PipelineBuilder, Transport, TransportFuture, TransportResponse};

    use super::handle;

    struct Accepting;

    impl Transport for Accepting {
        fn send(&self, _: Bytes) -> TransportFuture {
            Box::pin(async {
                Ok(TransportResponse { status: StatusCode::NO_CONTENT, body: String::new() })
            })
        }
    }

    fn pipeline() -> Pipeline {
        let (pipeline, _future) =
            PipelineBuilder::default().build_with_transport(Arc::new(Accepting)).unwrap();
        pipeline
    }

    #[tokio::test]
    async fn get_returns_stats_as_json() {
        let pipeline = pipeline();
        let request = Request::get("/").body(()).unwrap();

        let response = handle(&pipeline, &request);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            stats,
            serde_json::json!({
                "dropped": 0,
                "duplicate": 0,
                "sent": 0,
                "restored": 0,
                "expired": 0,
                "queued": 0,
            })
        );
    }

    #[test]
    fn any_path_is_served() {
        let pipeline = pipeline();
        let response = handle(&pipeline, &Request::get("/stats?pretty").body(()).unwrap());
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn other_methods_are_rejected() {
        let pipeline = pipeline();
        let request = Request::builder().method(Method::POST).uri("/").body(()).unwrap();
        assert_eq!(handle(&pipeline, &request).status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}

//! Request logging for the publication endpoint.
//!
//! Every call gets a request id (taken from `x-request-id` or generated) and
//! is logged with the calling peer's method path and duration.

use std::task::{Context, Poll};
use std::time::Instant;

use http::Request;
use tower::{Layer, Service};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A `Layer` that tags publication calls with request ids and logs them.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLoggerLayer;

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLoggerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RequestLoggerService { service }
    }
}

/// Service produced by [`RequestLoggerLayer`].
#[derive(Debug, Clone)]
pub struct RequestLoggerService<S> {
    service: S,
}

fn request_id<B>(request: &Request<B>) -> Option<String> {
    request.headers().get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()).map(ToString::to_string)
}

impl<S, B> Service<Request<B>> for RequestLoggerService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let request_id = request_id(&request).unwrap_or_else(|| {
            let generated = Uuid::new_v4().to_string();
            if let Ok(value) = http::HeaderValue::from_str(&generated) {
                request.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            generated
        });

        // gRPC paths look like /pxe.publication.Publication/GetPackageFileStream
        let rpc = request.uri().path().rsplit('/').next().unwrap_or_default().to_string();
        let start_time = Instant::now();

        debug!(request_id = %request_id, rpc = %rpc, "Publication call received");

        let future = self.service.call(request);
        Box::pin(async move {
            let result = future.await;
            let duration_ms = start_time.elapsed().as_millis();

            match &result {
                Ok(_) => info!(request_id = %request_id, rpc = %rpc, duration_ms, "Publication call completed"),
                Err(_) => warn!(request_id = %request_id, rpc = %rpc, duration_ms, "Publication call failed"),
            }

            result
        })
    }
}

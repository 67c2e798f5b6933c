//! Per-IP fixed-window rate limiting, applied as a `tower::Layer` per
//! route so each endpoint carries its own budget (spec.md §6), in the
//! spirit of `tower`'s own `Layer`/`Service` pattern.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};

use crate::error::AppError;

struct Window {
    count: u32,
    started_at: Instant,
}

struct Limiter {
    buckets: Mutex<HashMap<IpAddr, Window>>,
    max_requests: u32,
    window: Duration,
}

impl Limiter {
    fn check(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let entry = buckets.entry(ip).or_insert_with(|| Window {
            count: 0,
            started_at: now,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.count = 0;
            entry.started_at = now;
        }

        entry.count += 1;
        entry.count <= self.max_requests
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<Limiter>,
}

impl RateLimitLayer {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            limiter: Arc::new(Limiter {
                buckets: Mutex::new(HashMap::new()),
                max_requests,
                window,
            }),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<Limiter>,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());

        let allowed = match ip {
            Some(ip) => self.limiter.check(ip),
            // Without connection info (e.g. in tests built without
            // `into_make_service_with_connect_info`) fail open rather than
            // lock every request out.
            None => true,
        };

        let mut inner = self.inner.clone();
        Box::pin(async move {
            if allowed {
                inner.call(request).await
            } else {
                Ok(AppError::RateLimited.into_response())
            }
        })
    }
}

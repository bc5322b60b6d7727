//! Permissive CORS for the popup and the extension, which call the API from
//! their own origins.

use axum::{
    body::{boxed, BoxBody, Empty},
    http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode},
};
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::link::BoxFuture;

#[derive(Clone, Copy, Debug, Default)]
pub struct CorsLayer;

impl<S> Layer<S> for CorsLayer {
    type Service = CorsMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsMiddleware { inner }
    }
}

#[derive(Clone, Debug)]
pub struct CorsMiddleware<S> {
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for CorsMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // the clone may not be ready, so keep the one poll_ready was called on
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let origin = req.headers().get(header::ORIGIN).cloned();

        if req.method() == Method::OPTIONS {
            return Box::pin(async move {
                let mut resp = Response::new(boxed(Empty::new()));
                *resp.status_mut() = StatusCode::NO_CONTENT;
                allow(origin, resp.headers_mut());
                Ok(resp)
            });
        }

        Box::pin(async move {
            let mut resp = inner.call(req).await?;
            allow(origin, resp.headers_mut());
            Ok(resp)
        })
    }
}

/// Echoes a caller's origin so credentials work; a request without one gets
/// the wildcard.
fn allow(origin: Option<HeaderValue>, headers: &mut HeaderMap) {
    match origin {
        Some(origin) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
        None => {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        }
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_origin_or_wildcard() {
        let mut headers = HeaderMap::new();
        allow(
            Some(HeaderValue::from_static("chrome-extension://abc")),
            &mut headers,
        );
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "chrome-extension://abc"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");

        let mut headers = HeaderMap::new();
        allow(None, &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }
}

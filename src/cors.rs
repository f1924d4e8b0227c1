//! Cross-origin response decoration.
//!
//! Browsers refuse to hand a cross-origin response to scripts unless the
//! server opts in. This layer opts in, wide open: any origin may read, any
//! request header may be sent, credentials are allowed, and the method list
//! is the file server's whole surface (`GET, HEAD`).
//!
//! It wraps the handler from the outside as a plain request-in/response-out
//! decorator: preflights are answered before the handler runs, and ordinary
//! responses get their headers added after the handler returns but before
//! anything is flushed to the connection. Requests without an `Origin`
//! header pass through untouched.

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode, header};
use http_body_util::Full;

/// Response decorator adding cross-origin headers.
#[derive(Clone, Debug)]
pub struct Cors {
    allow_methods: HeaderValue,
}

impl Cors {
    /// The wide-open policy described in the module docs.
    pub fn permissive() -> Self {
        Self { allow_methods: HeaderValue::from_static("GET, HEAD") }
    }

    /// Answers a CORS preflight directly, or returns `None` for requests
    /// the handler should see. A preflight is OPTIONS plus `Origin` plus
    /// `Access-Control-Request-Method`.
    pub fn preflight<B>(&self, req: &Request<B>) -> Option<Response<Full<Bytes>>> {
        if req.method() != Method::OPTIONS {
            return None;
        }
        let origin = req.headers().get(header::ORIGIN)?.clone();
        req.headers().get(header::ACCESS_CONTROL_REQUEST_METHOD)?;

        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(Bytes::new()))
            .expect("statically valid response parts");
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        // Echo whatever headers the client plans to send; the file server
        // inspects none of them.
        if let Some(requested) = req.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        Some(response)
    }

    /// Adds cross-origin headers to an ordinary response.
    ///
    /// Credentialed responses must name the origin rather than use `*`, so
    /// the request's `Origin` is echoed back.
    pub fn decorate<B>(&self, req: &Request<B>, response: &mut Response<Full<Bytes>>) {
        let Some(origin) = req.headers().get(header::ORIGIN) else { return };
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
}

use axum::{extract::Request, middleware::Next, response::Response};
use http::{method::Method, StatusCode};

use crate::claims::{Access, Claims};

/// Whether `access` covers the permission bit the route needs
fn allowed(method: &Method, path: &str, access: Access) -> bool {
    match (method, path) {
        (&Method::POST, p) if p == api::path::STREAM_STOP => access.x,
        (&Method::GET, p) if p == api::path::STREAM_WS => access.w,
        (&Method::GET, _) => access.r,
        _ => access.w,
    }
}

pub async fn access_middleware(request: Request, next: Next) -> Response {
    let ok = match request.extensions().get::<Claims>() {
        Some(claims) => allowed(request.method(), request.uri().path(), claims.access()),
        None => false,
    };

    if !ok {
        let mut res = Response::new("Don't permission".into());
        *res.status_mut() = StatusCode::FORBIDDEN;
        return res;
    }

    next.run(request).await
}

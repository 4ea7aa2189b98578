//! Deciding which inbound requests reach the hosted application.
//!
//! The deployment puts a CloudFront distribution in front of the API Gateway,
//! and that distribution only forwards paths under our prefix to the Lambda.
//! But the gateway route is a catch-all, so anything that reaches the gateway
//! some other way (direct hits on the execute-api URL, scanners, stale cache
//! keys) lands here without the prefix. We don't rewrite those; we just send
//! back a canned 404 without waking up the hosted app.

use lambda_http::{request::RequestContext, Body, Request, RequestExt, Response};

/// The externally visible mount point of the hosted application.
///
/// Stored without leading or trailing slashes. An empty prefix means the app
/// is mounted directly at the root and every path is accepted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PathPrefix(String);

impl PathPrefix {
    pub fn new<S: AsRef<str>>(prefix: S) -> Self {
        PathPrefix(prefix.as_ref().trim_matches('/').to_owned())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The prefix as the hosted app wants it in its `base_url` setting:
    /// `/prefix/`, or `/` for a direct mount.
    pub fn base_url(&self) -> String {
        if self.0.is_empty() {
            "/".to_owned()
        } else {
            format!("/{}/", self.0)
        }
    }
}

/// Should a request for `request_path` be forwarded to the hosted app?
pub fn admit(request_path: &str, prefix: &PathPrefix) -> bool {
    if prefix.is_empty() {
        return true;
    }

    // Avoid allocating: check "/" + prefix + "/" piecewise.
    request_path
        .strip_prefix('/')
        .and_then(|rest| rest.strip_prefix(prefix.as_str()))
        .map_or(false, |rest| rest.starts_with('/'))
}

/// The response for requests that fail the prefix check.
///
/// With no headers and a text body, `lambda_http` serializes this as
/// `{"isBase64Encoded": false, "statusCode": 404, "headers": {},
/// "multiValueHeaders": {}, "body": "Not found"}`.
pub fn not_found() -> Response<Body> {
    let mut resp = Response::new(Body::Text("Not found".to_owned()));
    *resp.status_mut() = lambda_http::http::StatusCode::NOT_FOUND;
    resp
}

/// The path that API Gateway reported, without the stage component.
///
/// Requests that didn't come through the gateway (the oneshot driver, tests)
/// have no raw path recorded, so fall back to the URI.
pub fn inbound_path(req: &Request) -> &str {
    let raw = req.raw_http_path();

    if raw.is_empty() {
        req.uri().path()
    } else {
        raw
    }
}

/// The deployment stage name from the gateway request context, if any.
pub fn stage_name(req: &Request) -> Option<&str> {
    match req.request_context_ref()? {
        RequestContext::ApiGatewayV1(ctx) => ctx.stage.as_deref(),
        RequestContext::ApiGatewayV2(ctx) => ctx.stage.as_deref(),
        _ => None,
    }
}

/// Prefix `path` with the stage name.
///
/// Only needed when users hit the gateway URL directly (no CloudFront):
/// the hosted app needs the full externally visible path to build correct
/// links. See <https://github.com/simonw/datasette/issues/394>.
pub fn stage_qualified_path(path: &str, stage: Option<&str>) -> String {
    match stage.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
        Some(stage) => format!("/{stage}{path}"),
        None => path.to_owned(),
    }
}

/// The path to hand to the hosted app for an admitted request.
///
/// `lambda_http` puts the stage name back on the front of the URI path for
/// gateway events, which isn't what the gateway actually received. Undo
/// that, then optionally re-add it if the deployment wants stage-qualified
/// paths.
pub fn forward_path(req: &Request, prepend_stage: bool) -> String {
    let uri_path = req.uri().path();
    let raw = req.raw_http_path();
    let stage = stage_name(req);

    let path = match stage {
        Some(stage) if !raw.is_empty() && raw != uri_path => {
            strip_leading_segment(uri_path, stage.trim_matches('/'))
        }
        _ => uri_path,
    };

    if prepend_stage {
        stage_qualified_path(path, stage)
    } else {
        path.to_owned()
    }
}

fn strip_leading_segment<'a>(path: &'a str, segment: &str) -> &'a str {
    match path.strip_prefix('/').and_then(|p| p.strip_prefix(segment)) {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}

//! Static file serving.
//!
//! Maps `GET|HEAD mount/<rest>` to `base/<rest>` after normalization.
//! Paths that would climb out of the base directory are refused with `403`;
//! hidden entries (dot-prefixed names) and missing files fall through to
//! the next handler. Directories redirect `303 See Other` to the first
//! default file that exists. Conditional requests with
//! `If-Modified-Since` are answered `304 Not Modified` when the file has
//! not changed since the given instant.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::{HeaderValue, Method, Response, StatusCode, header};
use tracing::trace;

use tern_http::protocol::{BoxError, Entity, Flow, HttpRequest};

use crate::handler::RequestHandler;
use crate::pattern::{normalize_path, within_mount};

pub(crate) struct FileServer {
    mount: String,
    base: PathBuf,
    defaults: Vec<String>,
}

impl FileServer {
    pub(crate) fn new(mount: String, base: PathBuf, defaults: &[&str]) -> Self {
        Self { mount, base, defaults: defaults.iter().map(|s| (*s).to_owned()).collect() }
    }

    fn forward(req: HttpRequest) -> Result<Flow, BoxError> {
        Ok(Flow::Forward(req))
    }
}

#[async_trait]
impl RequestHandler for FileServer {
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Self::forward(req);
        }

        let Some(path) = normalize_path(req.uri().path()) else {
            // refuses to look at paths that escape the root
            return Self::forward(req);
        };
        if !within_mount(&self.mount, &path) {
            return Self::forward(req);
        }

        // strip the mount before mapping onto the base directory
        let rest = if self.mount == "/" { &path[1..] } else { path[self.mount.len()..].trim_start_matches('/') };

        let target = self.base.join(rest);
        if escapes_base(&target) {
            let response = Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Entity::empty())
                .expect("static response builds");
            return Ok(Flow::Respond(response));
        }
        if is_hidden(rest) {
            trace!(?target, "hidden path, falling through");
            return Self::forward(req);
        }

        let Ok(metadata) = tokio::fs::metadata(&target).await else {
            return Self::forward(req);
        };

        if metadata.is_dir() {
            for default in &self.defaults {
                if tokio::fs::metadata(target.join(default)).await.is_ok() {
                    let location = format!("{}/{}", path.trim_end_matches('/'), default);
                    let response = Response::builder()
                        .status(StatusCode::SEE_OTHER)
                        .header(header::LOCATION, HeaderValue::try_from(location)?)
                        .body(Entity::empty())?;
                    return Ok(Flow::Respond(response));
                }
            }
            return Self::forward(req);
        }

        let modified = metadata.modified().ok();

        if let (Some(since), Some(mtime)) = (parse_if_modified_since(&req), modified)
            && !strictly_after(mtime, since)
        {
            let response = Response::builder().status(StatusCode::NOT_MODIFIED).body(Entity::empty())?;
            return Ok(Flow::Respond(response));
        }

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, metadata.len())
            .header(header::CONTENT_TYPE, content_type(&target).as_ref());
        if let Some(mtime) = modified {
            builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(mtime));
        }

        let entity = if req.method() == Method::HEAD {
            Entity::empty()
        } else {
            match tokio::fs::File::open(&target).await {
                Ok(file) => Entity::file(file, metadata.len()),
                Err(_) => return Self::forward(req),
            }
        };

        Ok(Flow::Respond(builder.body(entity)?))
    }
}

/// The normalized request path cannot contain dot segments, so joining it
/// onto the base cannot climb; this guards against a base-relative escape
/// slipping in anyway.
fn escapes_base(target: &Path) -> bool {
    target.components().any(|component| matches!(component, Component::ParentDir))
}

fn is_hidden(rest: &str) -> bool {
    rest.split('/').any(|segment| segment.starts_with('.'))
}

fn parse_if_modified_since(req: &HttpRequest) -> Option<SystemTime> {
    let value = req.headers().get(header::IF_MODIFIED_SINCE)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}

/// HTTP dates carry whole seconds; compare at that granularity.
fn strictly_after(mtime: SystemTime, since: SystemTime) -> bool {
    match mtime.duration_since(since) {
        Ok(delta) => delta >= Duration::from_secs(1),
        Err(_) => false,
    }
}

fn content_type(path: &Path) -> mime::Mime {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => mime::TEXT_HTML_UTF_8,
        "css" => mime::TEXT_CSS,
        "js" => mime::TEXT_JAVASCRIPT,
        "json" => mime::APPLICATION_JSON,
        "txt" => mime::TEXT_PLAIN_UTF_8,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "svg" => mime::IMAGE_SVG,
        "pdf" => mime::APPLICATION_PDF,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

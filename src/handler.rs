//! The file-serving request handler.
//!
//! One request in, one response out. The handler resolves the URL path
//! against the document root, decides between serving a file, serving an
//! index page, rendering a directory listing, or rejecting, and builds the
//! response. It never touches the connection, so any wrapping layer (CORS,
//! tracing, anything request-in/response-out) can still change headers
//! before the response is flushed.
//!
//! Filesystem access is read-only. Every failure becomes an HTTP status
//! here; nothing propagates as an error.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::Full;
use percent_encoding::percent_decode_str;
use tracing::{debug, error};

use crate::config::Config;
use crate::listing::{self, DirEntry};
use crate::sort::SortPolicy;

/// Canonical index name probed inside directories when index serving is on.
const INDEX_PAGE: &str = "index.html";

/// The request handler. Construct once at startup from the resolved
/// [`Config`]; safe to share across concurrent requests, since it holds
/// nothing but the (immutable) policy flags and the document root.
pub struct FileServer {
    root: PathBuf,
    directory_listing: bool,
    sort: SortPolicy,
    serve_dotfiles: bool,
    serve_index: bool,
}

impl FileServer {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.root.clone(),
            directory_listing: config.directory_listing,
            sort: config.sort,
            serve_dotfiles: config.serve_dotfiles,
            serve_index: config.serve_index,
        }
    }

    /// Serves one request.
    ///
    /// GET and HEAD only; HEAD responses carry the same headers (including
    /// `Content-Length`) with an empty body. The request body, if any, is
    /// never read, which is why this is generic over it.
    pub async fn serve<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        let method = req.method();
        if method != Method::GET && method != Method::HEAD {
            return method_not_allowed();
        }

        let mut response = self.respond(req.uri().path()).await;
        if method == Method::HEAD {
            *response.body_mut() = Full::new(Bytes::new());
        }
        response
    }

    async fn respond(&self, raw_path: &str) -> Response<Full<Bytes>> {
        let full = match self.resolve(raw_path) {
            Ok(path) => path,
            Err(status) => return status_page(status),
        };

        let meta = match tokio::fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(e) => return self.io_error_page(&full, e),
        };

        if meta.is_dir() {
            if self.serve_index {
                let index = full.join(INDEX_PAGE);
                if let Ok(index_meta) = tokio::fs::metadata(&index).await {
                    if index_meta.is_file() {
                        return self.send_file(&index, &index_meta).await;
                    }
                }
            }
            if self.directory_listing {
                return self.send_listing(&full, raw_path).await;
            }
            return status_page(StatusCode::FORBIDDEN);
        }

        self.send_file(&full, &meta).await
    }

    /// Lexically resolves a URL path to a filesystem path under the root.
    ///
    /// Empty and `.` segments collapse; `..` pops. A pop past the root is an
    /// escape attempt and forbidden, so no resolved path can leave the root.
    /// The dotfile policy applies to every segment, not just the last one:
    /// with dotfiles hidden, nothing inside `/.git/` is reachable either.
    /// The filesystem is not consulted here.
    fn resolve(&self, raw_path: &str) -> Result<PathBuf, StatusCode> {
        let decoded = match percent_decode_str(raw_path).decode_utf8() {
            Ok(path) => path,
            Err(_) => return Err(StatusCode::NOT_FOUND),
        };

        let mut segments: Vec<&str> = Vec::new();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        debug!(path = raw_path, "rejected escape past document root");
                        return Err(StatusCode::FORBIDDEN);
                    }
                }
                _ if segment.contains('\0') => return Err(StatusCode::FORBIDDEN),
                _ => segments.push(segment),
            }
        }

        if !self.serve_dotfiles && segments.iter().any(|s| s.starts_with('.')) {
            return Err(StatusCode::FORBIDDEN);
        }

        let mut full = self.root.clone();
        for segment in &segments {
            full.push(segment);
        }
        Ok(full)
    }

    async fn send_file(&self, path: &Path, meta: &std::fs::Metadata) -> Response<Full<Bytes>> {
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) => return self.io_error_page(path, e),
        };

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime.to_string())
            .header(header::CONTENT_LENGTH, body.len());
        if let Ok(modified) = meta.modified() {
            builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(modified));
        }
        builder
            .body(Full::new(Bytes::from(body)))
            .expect("statically valid response parts")
    }

    async fn send_listing(&self, dir: &Path, raw_path: &str) -> Response<Full<Bytes>> {
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) => return self.io_error_page(dir, e),
        };

        let mut entries = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !self.serve_dotfiles && name.starts_with('.') {
                        continue;
                    }
                    // An entry can vanish between enumeration and stat; a
                    // listing missing it beats failing the whole page.
                    let Ok(meta) = entry.metadata().await else { continue };
                    entries.push(DirEntry {
                        is_dir: meta.is_dir(),
                        size: meta.len(),
                        modified: meta.modified().ok(),
                        name,
                    });
                }
                Ok(None) => break,
                Err(e) => return self.io_error_page(dir, e),
            }
        }

        self.sort.sort(&mut entries);
        let html = listing::render(raw_path, &entries);

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(header::CONTENT_LENGTH, html.len())
            .body(Full::new(Bytes::from(html)))
            .expect("statically valid response parts")
    }

    fn io_error_page(&self, path: &Path, e: io::Error) -> Response<Full<Bytes>> {
        match e.kind() {
            // NotADirectory is a path that walks through a file, e.g.
            // `/file.txt/child`. Missing either way.
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                status_page(StatusCode::NOT_FOUND)
            }
            io::ErrorKind::PermissionDenied => status_page(StatusCode::FORBIDDEN),
            _ => {
                error!(path = %path.display(), "filesystem error: {e}");
                status_page(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

// ── Response construction ─────────────────────────────────────────────────────

fn status_page(status: StatusCode) -> Response<Full<Bytes>> {
    let body = format!("{} {}\n", status.as_str(), status.canonical_reason().unwrap_or(""));
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)))
        .expect("statically valid response parts")
}

fn method_not_allowed() -> Response<Full<Bytes>> {
    let mut response = status_page(StatusCode::METHOD_NOT_ALLOWED);
    response
        .headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static("GET, HEAD"));
    response
}

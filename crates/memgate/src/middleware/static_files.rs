//! Static file serving under a URL prefix, with lexical traversal
//! protection.
//!
//! The factory verifies the root at construction time; a missing or
//! non-directory root degrades to a no-op passthrough instead of
//! failing startup. At request time anything that does not resolve to
//! a file strictly inside the root falls through to the next
//! middleware instead of erroring.

use std::path::{Component, Path, PathBuf};

use futures_util::future::BoxFuture;
use hyper::{Method, StatusCode};
use tracing::warn;

use crate::error::ApiError;
use crate::pipeline::{Action, Middleware};
use crate::request::{Reply, RequestContext};

/// Static file middleware.
pub struct StaticDir {
    prefix: String,
    /// `None` after a failed root check: the middleware is a no-op.
    root: Option<PathBuf>,
}

impl StaticDir {
    /// Build a middleware serving `root` under `prefix`.
    pub fn mount(prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        let root = root.into();

        if root.is_dir() {
            Self {
                prefix,
                root: Some(root),
            }
        } else {
            warn!(
                prefix = %prefix,
                root = %root.display(),
                "static root missing or not a directory; serving disabled",
            );
            Self { prefix, root: None }
        }
    }

    /// Resolve a request path to a file inside the root.
    ///
    /// Returns `None` (fall through) unless the remainder after the
    /// prefix normalizes to a non-empty relative path containing no
    /// parent-directory or absolute components.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        let remainder = path.strip_prefix(self.prefix.as_str())?;
        let remainder = remainder.trim_start_matches('/');

        // Percent-encoded traversal must not survive decoding.
        let decoded = urlencoding::decode(remainder).ok()?;
        if decoded.is_empty() {
            return None;
        }

        let mut relative = PathBuf::new();
        for component in Path::new(decoded.as_ref()).components() {
            match component {
                Component::Normal(segment) => relative.push(segment),
                Component::CurDir => {}
                // Anything that could step outside the root.
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }

        if relative.as_os_str().is_empty() {
            return None;
        }

        Some(root.join(relative))
    }
}

impl Middleware for StaticDir {
    fn name(&self) -> &'static str {
        "static-files"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Action, ApiError>> {
        Box::pin(async move {
            if ctx.method != Method::GET && ctx.method != Method::HEAD {
                return Ok(Action::Continue);
            }

            let Some(file) = self.resolve(&ctx.path) else {
                return Ok(Action::Continue);
            };

            match tokio::fs::read(&file).await {
                Ok(bytes) => {
                    let mime = mime_guess::from_path(&file).first_or_octet_stream();
                    let reply = Reply::status(StatusCode::OK)
                        .header("content-type", mime.as_ref())
                        .header("content-length", bytes.len().to_string());

                    let response = if ctx.method == Method::HEAD {
                        reply.empty()
                    } else {
                        reply.bytes(bytes.into())
                    };
                    Ok(Action::ShortCircuit(response))
                }
                Err(e) => match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory => {
                        Ok(Action::Continue)
                    }
                    // Directory targets are a miss, not an error.
                    _ if file.is_dir() => Ok(Action::Continue),
                    _ => Err(ApiError::Internal(format!(
                        "failed to read {}: {}",
                        file.display(),
                        e
                    ))),
                },
            }
        })
    }
}

//! Streaming JSON body ingestion with a hard size bound.
//!
//! Only requests whose content-type contains `application/json` are
//! buffered. The cumulative size is checked on every frame so an
//! oversized payload is cut off mid-stream instead of being read to
//! completion. Parse failures yield a null sentinel, not an error;
//! "bad body" handling belongs to the route handler.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use thiserror::Error;

/// Errors while reading a request body.
#[derive(Debug, Error)]
pub enum BodyError {
    /// Cumulative body size exceeded the configured bound.
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// The transport failed mid-read.
    #[error("failed to read request body: {0}")]
    Read(String),
}

/// Whether the ingester activates for this content-type.
pub fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false)
}

/// Stream and parse a JSON request body.
///
/// Returns `Ok(None)` for non-JSON requests (nothing is buffered) and
/// for JSON bodies that fail to parse. Returns `Err(TooLarge)` the
/// moment the accumulated bytes pass `max_bytes`; the remainder of the
/// stream is never polled.
pub async fn ingest_json(
    content_type: Option<&str>,
    content_length: Option<usize>,
    body: Incoming,
    max_bytes: usize,
) -> Result<Option<serde_json::Value>, BodyError> {
    if !is_json(content_type) {
        return Ok(None);
    }

    // Declared length over the bound: reject before reading anything.
    if let Some(len) = content_length {
        if len > max_bytes {
            return Err(BodyError::TooLarge { limit: max_bytes });
        }
    }

    let mut buf: Vec<u8> = Vec::with_capacity(content_length.unwrap_or(0).min(max_bytes));
    let mut body = body;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| BodyError::Read(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            if buf.len() + data.len() > max_bytes {
                return Err(BodyError::TooLarge { limit: max_bytes });
            }
            buf.extend_from_slice(&data);
        }
    }

    Ok(serde_json::from_slice(&buf).ok())
}

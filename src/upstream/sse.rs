//! Decoding of the upstream SSE envelope stream.
//!
//! The backend speaks line-oriented SSE: `data: ` lines carrying either a
//! `{response: …}` envelope or a bare response object, interleaved with
//! comments and blank lines. The scanner here turns an arbitrary chunking of
//! bytes into complete lines (with a hard per-line cap), and the parser turns
//! data lines into responses. Malformed payloads are logged by size only and
//! skipped; secrets never reach the logs.

use serde_json::Value;
use tracing::error;

use super::UpstreamError;
use crate::gemini::{GenerateContentResponse, UsageMetadata};

/// Hard cap on a single SSE line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Accumulates byte chunks and yields complete `\n`-terminated lines.
#[derive(Debug)]
pub struct LineScanner {
    buf: Vec<u8>,
    limit: usize,
}

impl LineScanner {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Feed a chunk, returning every line completed by it.
    ///
    /// Errors once any single line exceeds the cap; the stream is then
    /// unusable and must be torn down.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, UpstreamError> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.limit {
                return Err(UpstreamError::OversizedLine { limit: self.limit });
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.buf.len() > self.limit {
            return Err(UpstreamError::OversizedLine { limit: self.limit });
        }
        Ok(lines)
    }

    /// The trailing unterminated line, if any. Call once at EOF.
    pub fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}

impl Default for LineScanner {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

/// Decode one SSE line into a response, if it carries one.
///
/// Returns `None` for blanks, comments, non-data lines, `[DONE]`, and
/// malformed payloads.
pub fn parse_data_line(line: &str) -> Option<GenerateContentResponse> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data: ")?.trim();
    if data == "[DONE]" {
        return None;
    }

    let raw: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(err) => {
            error!(error = %err, data_bytes = data.len(), "failed to parse SSE data as JSON");
            return None;
        }
    };
    let map = raw.as_object()?;

    let mut response: GenerateContentResponse;
    let mut envelope_usage: Option<UsageMetadata> = None;

    if let Some(inner) = map.get("response") {
        response = match serde_json::from_value(inner.clone()) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, data_bytes = data.len(), "failed to decode envelope response");
                return None;
            }
        };
        if let Some(usage) = map.get("usageMetadata") {
            envelope_usage = serde_json::from_value(usage.clone()).ok();
        }
    } else {
        response = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, data_bytes = data.len(), "failed to decode SSE data as response");
                return None;
            }
        };
    }

    if response.usage_metadata.is_none() {
        response.usage_metadata = envelope_usage;
    }
    Some(response)
}

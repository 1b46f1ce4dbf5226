//! HTTP exchange and byte-to-line framing.

use std::fmt;
use std::pin::Pin;

use futures::StreamExt as _;
use tracing::debug;

use crate::errors::TransportError;
use crate::request::RequestEnvelope;

/// Incrementally readable response body.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, TransportError>> + Send + 'static>>;

/// Status plus body of one dispatched request. Dropping it releases the
/// connection.
pub struct TransportResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    /// Reads the whole body as lossy UTF-8. Used for error responses only.
    pub async fn text(mut self) -> Result<String, TransportError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.body.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// One request/response exchange.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestEnvelope) -> Result<TransportResponse, TransportError>;
}

/// HTTPS transport backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a client with the given connect timeout. No overall timeout is
    /// set: streamed responses may legitimately run for minutes.
    pub fn new(connect_timeout: std::time::Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("termchat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestEnvelope) -> Result<TransportResponse, TransportError> {
        debug!(endpoint = request.endpoint(), "dispatching chat request");
        let response = self
            .client
            .post(request.endpoint())
            .bearer_auth(request.api_key())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body())
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Read(e.to_string())));
        Ok(TransportResponse {
            status,
            body: Box::pin(body),
        })
    }
}

/// Splits a chunked byte stream into `\n`-terminated lines. Trailing `\r` is
/// removed; chunk boundaries may fall anywhere, including inside a UTF-8
/// sequence.
#[derive(Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            lines.push(decode_line(&self.buf[start..end]));
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        lines
    }

    /// Returns the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(decode_line(&rest))
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches('\r').to_string()
}

//! HTTP client for the WCS upload endpoints

use super::{
    AssembleMetadata, ChunkReceipt, ObjectDescriptor, SessionAuth, Transport, TransportError,
};
use crate::config::EndpointConfig;
use crate::metrics;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use bytes::Bytes;
use serde::de::DeserializeOwned;

const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain;charset=UTF-8";

/// Longest response body excerpt kept in an error message
const MAX_BODY_EXCERPT: usize = 512;

/// Default `User-Agent`, e.g. `wcs-uploadr/0.1.0 (linux/x86_64)`
pub fn default_user_agent() -> String {
    format!(
        "wcs-uploadr/{} ({}/{})",
        crate::VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// reqwest-backed [`Transport`]
pub struct WcsClient {
    put_domain: String,
    user_agent: String,
    http_client: reqwest::Client,
}

impl WcsClient {
    /// Create a client for `config.put_domain`.
    ///
    /// Every call is bounded by `request_timeout_seconds`; running into it
    /// surfaces as [`TransportError::Timeout`].
    pub fn new(config: &EndpointConfig) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            put_domain: config.put_domain.trim_end_matches('/').to_string(),
            user_agent: config
                .user_agent
                .clone()
                .unwrap_or_else(default_user_agent),
            http_client,
        })
    }

    /// Get the upload domain
    pub fn put_domain(&self) -> &str {
        &self.put_domain
    }

    fn post(&self, path: &str, auth: &SessionAuth, content_type: &str) -> reqwest::RequestBuilder {
        self.http_client
            .post(format!("{}{}", self.put_domain, path))
            .header("Authorization", auth.credential.as_str())
            .header("Content-Type", content_type)
            .header("uploadBatch", auth.upload_batch.as_str())
            .header("User-Agent", self.user_agent.as_str())
    }

    /// Send one request and return the body of a success response
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Bytes, TransportError> {
        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                TransportError::InvalidRequest(e.to_string())
            } else {
                TransportError::Timeout(e.to_string())
            }
        })?;

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Remote {
                status: status.as_u16(),
                body: excerpt(body.as_bytes()),
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| TransportError::Timeout(format!("reading response body: {}", e)))
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(body)
        .map_err(|e| TransportError::InvalidResponse(format!("{}: {}", e, excerpt(body))))
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX_BODY_EXCERPT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

fn outcome<T>(result: &Result<T, TransportError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(TransportError::Timeout(_)) => "timeout",
        Err(TransportError::Remote { .. }) => "rejected",
        Err(TransportError::InvalidResponse(_)) => "invalid_response",
        Err(TransportError::InvalidRequest(_)) => "invalid_request",
    }
}

/// `mkfile` path with the optional user segments
fn assemble_path(file_size: u64, metadata: &AssembleMetadata) -> String {
    let mut path = format!("/mkfile/{}", file_size);
    if let Some(ref user_param) = metadata.user_param {
        path.push('/');
        path.push_str(user_param);
        if let Some(ref vars) = metadata.encoded_user_vars {
            path.push('/');
            path.push_str(vars);
        }
    }
    path
}

#[async_trait]
impl Transport for WcsClient {
    #[tracing::instrument(
        name = "wcs.open_block",
        skip(self, first_chunk, auth),
        fields(
            wcs.block_index = block_index,
            wcs.block_size = block_size,
            upload.bytes = first_chunk.len(),
            wcs.ctx = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn open_block(
        &self,
        block_index: u32,
        block_size: u64,
        first_chunk: Bytes,
        auth: &SessionAuth,
    ) -> Result<ChunkReceipt, TransportError> {
        let request = self
            .post(
                &format!("/mkblk/{}/{}", block_size, block_index),
                auth,
                OCTET_STREAM,
            )
            .body(first_chunk);

        let result = match self.execute(request).await {
            Ok(body) => parse::<ChunkReceipt>(&body),
            Err(e) => Err(e),
        };
        metrics::record_remote_call("open-block", outcome(&result));

        let receipt = result?;
        tracing::Span::current().record("wcs.ctx", receipt.ctx.as_str());
        tracing::debug!(block_index, "Block opened");
        Ok(receipt)
    }

    #[tracing::instrument(
        name = "wcs.append_chunk",
        skip(self, chunk, auth),
        fields(
            wcs.offset = offset,
            upload.bytes = chunk.len(),
            wcs.ctx = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn append_chunk(
        &self,
        context: &str,
        offset: u64,
        chunk: Bytes,
        auth: &SessionAuth,
    ) -> Result<ChunkReceipt, TransportError> {
        let request = self
            .post(&format!("/bput/{}/{}", context, offset), auth, OCTET_STREAM)
            .body(chunk);

        let result = match self.execute(request).await {
            Ok(body) => parse::<ChunkReceipt>(&body),
            Err(e) => Err(e),
        };
        metrics::record_remote_call("append-chunk", outcome(&result));

        let receipt = result?;
        tracing::Span::current().record("wcs.ctx", receipt.ctx.as_str());
        Ok(receipt)
    }

    #[tracing::instrument(
        name = "wcs.assemble",
        skip(self, contexts, auth, metadata),
        fields(
            wcs.key = %metadata.key,
            wcs.file_size = file_size,
            wcs.blocks = contexts.len(),
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn assemble(
        &self,
        file_size: u64,
        contexts: &[String],
        auth: &SessionAuth,
        metadata: &AssembleMetadata,
    ) -> Result<ObjectDescriptor, TransportError> {
        let mut request = self
            .post(&assemble_path(file_size, metadata), auth, TEXT_PLAIN)
            .header("key", URL_SAFE.encode(metadata.key.as_bytes()));

        if let Some(ref mime_type) = metadata.mime_type {
            request = request.header("mimeType", mime_type.as_str());
        }

        let request = request.body(contexts.join(","));

        let result = match self.execute(request).await {
            Ok(body) => parse::<ObjectDescriptor>(&body),
            Err(e) => Err(e),
        };
        metrics::record_remote_call("assemble", outcome(&result));

        let descriptor = result?;
        tracing::info!(key = %metadata.key, file_size, "Object assembled");
        Ok(descriptor)
    }
}

use std::io::Write;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::Utc;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{parse_retry_after, Transport, TransportRequest, TransportResponse};
use crate::codec::{Blob, BlobWriter};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};

/// HTTPS transport for protocol commands
pub struct HttpTransport {
    client: reqwest::Client,
    resolver: TokioAsyncResolver,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        })
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
        let url = request.command_url();
        debug!(command = %request.command, bytes = request.body.len(), "POST {}", request.url);

        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, request.content_type)
            .header("MS-ASProtocolVersion", request.protocol_version.as_str())
            .header("X-MS-PolicyKey", request.policy_key.as_str())
            .body(request_body(request.body)?);

        if let Some(credential) = &request.credential {
            builder = builder.basic_auth(&credential.username, Some(&credential.secret));
        }

        let mut response = builder.send().await?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let mut spool = BlobWriter::new(request.spool_threshold);
        while let Some(chunk) = response.chunk().await? {
            spool.write_all(&chunk)?;
        }
        let body = spool.finish()?;

        debug!(command = %request.command, status, bytes = body.len(), "Response received");

        Ok(TransportResponse {
            status,
            body,
            retry_after,
        })
    }
}

/// Spooled bodies stream from their temp file instead of being read back
/// into memory
fn request_body(blob: Blob) -> Result<reqwest::Body> {
    Ok(match blob {
        Blob::Inline(bytes) => reqwest::Body::from(bytes),
        Blob::Spooled { file, .. } => {
            reqwest::Body::from(tokio::fs::File::from_std(file.reopen()?))
        }
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<TransportResponse> {
        let command = request.command.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(command = %command, "Request cancelled");
                Err(SyncError::Cancelled)
            }
            result = self.execute(request) => result,
        }
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                warn!("No DNS records for {}: {}", host, e);
                Err(SyncError::NotFound(format!("no DNS records for {}", host)))
            }
            Err(e) => {
                warn!("DNS lookup failed for {}: {}", host, e);
                Err(SyncError::TransientNetwork(format!(
                    "DNS lookup failed for {}: {}",
                    host, e
                )))
            }
        }
    }
}

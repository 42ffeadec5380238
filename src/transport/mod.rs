//! Transport contract between the protocol engine and the network
//!
//! The engine hands over an encoded command and gets back a status code and
//! raw bytes. Bodies past the spool threshold live in temp files on both
//! sides of the round trip. Timeouts and cancellation are the transport's job; mapping the
//! status to an engine event is not.

pub mod http;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::Blob;
use crate::error::Result;
use crate::types::Credential;

pub use http::HttpTransport;

pub const CONTENT_TYPE_WBXML: &str = "application/vnd.ms-sync.wbxml";

/// One protocol command on its way out
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    /// Command name, sent as the `Cmd` query parameter
    pub command: String,
    pub device_id: String,
    pub protocol_version: String,
    pub policy_key: String,
    pub credential: Option<Credential>,
    pub content_type: &'static str,
    pub body: Blob,
    /// Response bodies longer than this are read into a temp file
    pub spool_threshold: usize,
}

impl TransportRequest {
    /// Endpoint URL with the command query appended
    pub fn command_url(&self) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("Cmd", &self.command);
            if let Some(credential) = &self.credential {
                query.append_pair("User", &credential.username);
            }
            query.append_pair("DeviceId", &self.device_id);
            query.append_pair("DeviceType", "eddie");
        }
        url
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Blob,
    /// Server-directed backoff, from `Retry-After`
    pub retry_after: Option<Duration>,
}

impl TransportResponse {
    pub fn ok(body: impl Into<Blob>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Blob::Inline(Vec::new()),
            retry_after: None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one command. Resolves to `SyncError::Cancelled` when `cancel`
    /// fires first.
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<TransportResponse>;

    /// Look up a server's addresses. A name that does not exist is
    /// `SyncError::NotFound`; anything worth retrying is transient.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Parse a `Retry-After` value: delta seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::error::SyncError;

    pub enum Scripted {
        Respond(TransportResponse),
        Fail(SyncError),
        /// Never answers; only cancellation ends the call
        Hang,
    }

    /// Plays back canned outcomes in order and records what was sent.
    /// Lookups answer 127.0.0.1 unless a result was queued.
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        lookups: Mutex<VecDeque<Result<Vec<IpAddr>>>>,
        resolved: Mutex<Vec<String>>,
        sent: Mutex<Vec<TransportRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, step: Scripted) {
            self.script
                .lock()
                .expect("script lock")
                .push_back(step);
        }

        pub fn respond(&self, response: TransportResponse) {
            self.push(Scripted::Respond(response));
        }

        pub fn push_lookup(&self, result: Result<Vec<IpAddr>>) {
            self.lookups
                .lock()
                .expect("lookup lock")
                .push_back(result);
        }

        pub fn resolved(&self) -> Vec<String> {
            self.resolved.lock().expect("resolved lock").clone()
        }

        pub fn sent(&self) -> Vec<TransportRequest> {
            self.sent.lock().expect("sent lock").clone()
        }

        pub fn sent_commands(&self) -> Vec<String> {
            self.sent().into_iter().map(|r| r.command).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: TransportRequest,
            cancel: CancellationToken,
        ) -> Result<TransportResponse> {
            self.sent.lock().expect("sent lock").push(request);
            let step = self.script.lock().expect("script lock").pop_front();
            match step {
                Some(Scripted::Respond(response)) => Ok(response),
                Some(Scripted::Fail(err)) => Err(err),
                Some(Scripted::Hang) => {
                    cancel.cancelled().await;
                    Err(SyncError::Cancelled)
                }
                None => Err(SyncError::TransientNetwork("script exhausted".into())),
            }
        }

        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            self.resolved
                .lock()
                .expect("resolved lock")
                .push(host.to_string());
            let step = self.lookups.lock().expect("lookup lock").pop_front();
            step.unwrap_or_else(|| Ok(vec![IpAddr::from([127, 0, 0, 1])]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_retry_after() {
        let now = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Mon, 01 Jan 2024 12:00:30 +0000", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Mon, 01 Jan 2024 11:00:00 +0000", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_command_url() {
        let request = TransportRequest {
            url: Url::parse("https://mail.example.com/Microsoft-Server-ActiveSync")
                .expect("url"),
            command: "FolderSync".into(),
            device_id: "dev1".into(),
            protocol_version: "12.0".into(),
            policy_key: "0".into(),
            credential: Some(Credential {
                account_id: "a".into(),
                username: "me@example.com".into(),
                secret: "pw".into(),
            }),
            content_type: CONTENT_TYPE_WBXML,
            body: Blob::Inline(Vec::new()),
            spool_threshold: 1024,
        };
        let url = request.command_url();
        let query = url.query().expect("query");
        assert!(query.starts_with("Cmd=FolderSync&User=me%40example.com&DeviceId=dev1"));
    }
}

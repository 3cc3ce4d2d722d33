use std::fmt;
use std::future::Future;
use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use reqwest::Client;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use thiserror::Error;
use url::Url;

use crate::config::{self, Compression, ConfigError};
use crate::event::{EventBatch, EventRecord};

/// Where batches are delivered: the collector endpoint and an optional
/// bearer credential.
#[derive(Clone, PartialEq)]
pub struct Destination {
    endpoint: Url,
    credential: Option<String>,
}

impl Destination {
    pub fn new(endpoint: Url, credential: Option<String>) -> Self {
        Self {
            endpoint,
            credential,
        }
    }

    pub fn parse(endpoint: &str, credential: Option<&str>) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config::parse_endpoint(endpoint)?,
            credential.map(str::to_owned),
        ))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("endpoint", &self.endpoint.as_str())
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector rejected batch: {status}")]
    Rejected { status: reqwest::StatusCode },

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("gzip compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Delivers one batch per call. Implementations must not retry internally;
/// a failed batch is requeued by the caller.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        destination: &Destination,
        batch: &[EventRecord],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

pub struct HttpTransport {
    client: Client,
    compression: Compression,
}

impl HttpTransport {
    /// `timeout` bounds each request so a stalled collector cannot hold the
    /// in-flight guard forever.
    pub fn new(timeout: Duration, compression: Compression) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            compression,
        })
    }
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        destination: &Destination,
        batch: &[EventRecord],
    ) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&EventBatch { events: batch })?;

        let mut req = self
            .client
            .post(destination.endpoint().clone())
            .header(CONTENT_TYPE, "application/json");

        let body = match self.compression {
            Compression::Gzip => {
                req = req.header(CONTENT_ENCODING, "gzip");
                compress_gzip(&body)?
            }
            Compression::None => body,
        };

        if let Some(token) = destination.credential() {
            req = req.bearer_auth(token);
        }

        let resp = req.body(body).send().await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                status: resp.status(),
            })
        }
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

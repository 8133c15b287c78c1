use std::io::BufReader;
use std::time::Duration;

use tracing::info;

use crate::error::{Result, SporcError};

/// Blocking HTTP reader for corpus files published under a base URL.
///
/// Responses are consumed as byte streams; nothing is buffered beyond the
/// `BufReader` window, and the stream cannot seek.
#[derive(Clone)]
pub struct RemoteClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        // Long downloads: only bound the connect phase.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()?;
        Ok(Self::with_client(base_url, token, client))
    }

    /// Use a preconfigured HTTP client (proxy, TLS roots, timeouts).
    pub fn with_client(
        base_url: impl Into<String>,
        token: Option<String>,
        client: reqwest::blocking::Client,
    ) -> Self {
        RemoteClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url, file_name)
    }

    /// Open `<base_url>/<file_name>` as a streaming reader.
    pub fn open(&self, file_name: &str) -> Result<BufReader<reqwest::blocking::Response>> {
        let url = self.url_for(file_name);
        let mut req = self.client.get(&url);
        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let resp = req.send()?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SporcError::DatasetAccess(format!(
                "{url} returned {status}; check the configured access token"
            )));
        }
        if !status.is_success() {
            return Err(SporcError::DatasetAccess(format!("{url} returned {status}")));
        }

        info!("Streaming remote file: {url}");
        Ok(BufReader::with_capacity(256 * 1024, resp))
    }
}

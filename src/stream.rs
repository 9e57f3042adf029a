//! Destination descriptor for a published stream.

use crate::errors::StreamingError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Default RTMP port used when the push URL does not carry one.
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// The logical destination a session publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Stream identifier, informational only
    pub id: String,
    publish_url: Url,
}

impl Stream {
    /// Create a stream from a publish URL such as `rtmp://host/app/key`.
    pub fn new(publish_url: &str) -> Result<Self, StreamingError> {
        let url = Url::parse(publish_url)
            .map_err(|e| StreamingError::InvalidStream(format!("{publish_url}: {e}")))?;
        Self::from_url(url)
    }

    pub fn from_url(url: Url) -> Result<Self, StreamingError> {
        if url.host_str().map_or(true, str::is_empty) {
            return Err(StreamingError::InvalidStream(format!(
                "{url}: publish URL has no host"
            )));
        }
        let id = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            id,
            publish_url: url,
        })
    }

    pub fn publish_url(&self) -> &Url {
        &self.publish_url
    }

    /// Resolve the URL to push to, replacing the host with `host_override`
    /// when one is present. The override may carry a port (`host:port`).
    pub fn push_url(&self, host_override: Option<&str>) -> Result<Url, StreamingError> {
        let host_override = match host_override.map(str::trim) {
            Some(h) if !h.is_empty() => h,
            _ => return Ok(self.publish_url.clone()),
        };

        let mut url = self.publish_url.clone();
        let (host, port) = split_host_port(host_override)?;
        url.set_host(Some(host))
            .map_err(|e| StreamingError::InvalidStream(format!("{host_override}: {e}")))?;
        if let Some(port) = port {
            url.set_port(Some(port))
                .map_err(|_| StreamingError::InvalidStream(format!("{host_override}: bad port")))?;
        }
        Ok(url)
    }
}

fn split_host_port(value: &str) -> Result<(&str, Option<u16>), StreamingError> {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| StreamingError::InvalidStream(format!("{value}: bad port")))?;
            Ok((host, Some(port)))
        }
        _ => Ok((value, None)),
    }
}

/// `host:port` pair to dial for a push URL.
pub fn socket_target(url: &Url) -> Result<(String, u16), StreamingError> {
    let host = url
        .host_str()
        .ok_or_else(|| StreamingError::InvalidStream(format!("{url}: no host")))?;
    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_RTMP_PORT)))
}

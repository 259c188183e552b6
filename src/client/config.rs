//! Client configuration and RTMP URI handling

use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::{FLASH_VER, PUBLISH_CHUNK_SIZE, RTMP_PORT, WATCHDOG_TIMEOUT_MS};

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// RTMP URL to publish to (rtmp[s]://host[:port]/app/key)
    pub url: String,

    /// Timeout covering name resolution and the TCP connect
    pub connect_timeout: Duration,

    /// Socket watchdog: inactivity longer than this disconnects
    pub watchdog_timeout: Duration,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,

    /// Flash version string sent in the connect object
    pub flash_ver: String,

    /// Chunk size announced right after `connect`
    pub chunk_size: u32,

    /// Capacity of the event channel handed back to the caller
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            watchdog_timeout: Duration::from_millis(WATCHDOG_TIMEOUT_MS),
            tcp_nodelay: true,
            flash_ver: FLASH_VER.to_string(),
            chunk_size: PUBLISH_CHUNK_SIZE,
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Parse the configured URL
    pub fn uri(&self) -> Result<RtmpUri> {
        RtmpUri::parse(&self.url)
    }
}

/// Parsed RTMP URI components
///
/// Form: `rtmp[s]://host[:port]/app/key`, where `key` is the remainder of
/// the path and may itself contain slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUri {
    pub secure: bool,
    pub host: String,
    /// Explicit port, when one was present in the input
    pub port: Option<u16>,
    pub app: String,
    pub key: String,
}

impl RtmpUri {
    /// Parse an RTMP URI
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidUri(uri.to_string());

        let (secure, rest) = if let Some(rest) = uri.strip_prefix("rtmps://") {
            (true, rest)
        } else if let Some(rest) = uri.strip_prefix("rtmp://") {
            (false, rest)
        } else {
            return Err(invalid().into());
        };

        let (addr, path) = rest.split_once('/').ok_or_else(invalid)?;
        let (app, key) = path.split_once('/').ok_or_else(invalid)?;
        if addr.is_empty() || app.is_empty() || key.is_empty() {
            return Err(invalid().into());
        }

        let (host, port) = match addr.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| invalid())?;
                (host, Some(port))
            }
            None => (addr, None),
        };
        if host.is_empty() {
            return Err(invalid().into());
        }

        Ok(RtmpUri {
            secure,
            host: host.to_string(),
            port,
            app: app.to_string(),
            key: key.to_string(),
        })
    }

    /// Port to connect to, falling back to the RTMP default
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(RTMP_PORT)
    }

    fn scheme(&self) -> &'static str {
        if self.secure {
            "rtmps"
        } else {
            "rtmp"
        }
    }

    /// tcUrl value for the connect object
    pub fn tc_url(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.scheme(),
            self.host,
            self.port_or_default(),
            self.app
        )
    }

    /// Rewrite the URI with `app` and `key` masked, for logging
    ///
    /// The explicit port is kept only when the input carried one.
    pub fn anonymized(&self) -> String {
        let app = anonymize_str(&self.app);
        let key = anonymize_str(&self.key);
        match self.port {
            Some(port) => format!("{}://{}:{}/{}/{}", self.scheme(), self.host, port, app, key),
            None => format!("{}://{}/{}/{}", self.scheme(), self.host, app, key),
        }
    }
}

/// Anonymize an RTMP URI for logging
pub fn anonymize_uri(uri: &str) -> Result<String> {
    Ok(RtmpUri::parse(uri)?.anonymized())
}

/// Keep the first and last two characters, mask everything between
///
/// Strings shorter than four characters are returned verbatim.
pub fn anonymize_str(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    if chars.len() < 4 {
        return input.to_string();
    }
    chars
        .iter()
        .enumerate()
        .map(|(i, &c)| if i < 2 || i >= chars.len() - 2 { c } else { '*' })
        .collect()
}

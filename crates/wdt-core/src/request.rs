//! Transfer request and the `wdt://` URL form.
//!
//! `wdt://host[:port]?transferId=...&protocol=...&ports=p1,p2&dir=...&enc=proto:hexkey`
//!
//! The `enc` parameter carries the session secret, so a request has two
//! stringifications: the full URL (for handing to the peer) and a log-safe
//! one that redacts the secret.

use crate::protocol::{self, MAX_TRANSFER_ID_LENGTH};
use std::path::PathBuf;
use thiserror::Error;
use wdt_files::WdtFileInfo;
use wdt_transport::{CipherError, EncryptionParams};

const URL_PREFIX: &str = "wdt://";
const TRANSFER_ID_PARAM: &str = "transferId";
const PROTOCOL_PARAM: &str = "protocol";
const PORTS_PARAM: &str = "ports";
const DIRECTORY_PARAM: &str = "dir";
const ENCRYPTION_PARAM: &str = "enc";

/// Transfer-request parsing and validation errors
#[derive(Debug, Error)]
pub enum RequestError {
    /// The URL does not start with `wdt://`
    #[error("url must start with {URL_PREFIX}")]
    InvalidScheme,

    /// The URL has no host
    #[error("url has no host")]
    MissingHost,

    /// A port list entry or the host port is not a valid port number
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// The protocol query parameter is not an integer
    #[error("invalid protocol version: {0}")]
    InvalidProtocol(String),

    /// The transfer id is longer than the protocol allows
    #[error("transfer id longer than {MAX_TRANSFER_ID_LENGTH} bytes")]
    TransferIdTooLong,

    /// No ports were specified
    #[error("no ports specified")]
    NoPorts,

    /// The encryption parameter could not be parsed
    #[error(transparent)]
    Encryption(#[from] CipherError),
}

/// Minimal URI parser for the `wdt://` scheme
#[derive(Debug, Clone, Default)]
pub struct WdtUri {
    /// Host name or address
    pub host: String,
    /// Optional port in the authority component
    pub port: Option<u16>,
    /// Query parameters in order of appearance
    pub params: Vec<(String, String)>,
}

impl WdtUri {
    /// Parse a `wdt://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] on a missing scheme or host or an
    /// unparsable authority port.
    pub fn parse(url: &str) -> Result<Self, RequestError> {
        let rest = url
            .strip_prefix(URL_PREFIX)
            .ok_or(RequestError::InvalidScheme)?;
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) if !port_str.is_empty() && !host.is_empty() => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| RequestError::InvalidPort(port_str.to_string()))?;
                (host.to_string(), Some(port))
            }
            _ => (authority.to_string(), None),
        };
        if host.is_empty() {
            return Err(RequestError::MissingHost);
        }
        let mut params = Vec::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((key, value)) => params.push((key.to_string(), value.to_string())),
                    None => params.push((pair.to_string(), String::new())),
                }
            }
        }
        Ok(Self { host, port, params })
    }

    /// First value of the named query parameter
    #[must_use]
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize back into URL form
    #[must_use]
    pub fn to_url(&self) -> String {
        let mut url = format!("{URL_PREFIX}{}", self.host);
        if let Some(port) = self.port {
            url.push(':');
            url.push_str(&port.to_string());
        }
        for (i, (key, value)) in self.params.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(key);
            url.push('=');
            url.push_str(value);
        }
        url
    }
}

/// Everything needed to start a sender: where to connect, what to send and
/// how the session is identified and keyed.
#[derive(Debug, Clone)]
pub struct WdtTransferRequest {
    /// Destination host
    pub host: String,
    /// Receiver ports, one connection each
    pub ports: Vec<u16>,
    /// Transfer id, must match the receiver's
    pub transfer_id: String,
    /// Negotiated protocol version to start from
    pub protocol_version: i32,
    /// Encryption algorithm and session key
    pub encryption: EncryptionParams,
    /// Source root directory
    pub directory: PathBuf,
    /// Explicit file list; empty means discover the directory
    pub file_info: Vec<WdtFileInfo>,
    /// Use the file list even when it is empty
    pub disable_directory_traversal: bool,
}

impl WdtTransferRequest {
    /// Request for `num_ports` consecutive ports starting at `start_port`
    #[must_use]
    pub fn new(host: impl Into<String>, start_port: u16, num_ports: u16, directory: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            ports: (start_port..start_port + num_ports).collect(),
            transfer_id: String::new(),
            protocol_version: protocol::PROTOCOL_VERSION,
            encryption: EncryptionParams::none(),
            directory: directory.into(),
            file_info: Vec::new(),
            disable_directory_traversal: false,
        }
    }

    /// Build a request from a `wdt://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the URL is malformed or inconsistent.
    pub fn from_url(url: &str) -> Result<Self, RequestError> {
        let uri = WdtUri::parse(url)?;
        let mut ports = Vec::new();
        if let Some(list) = uri.query_param(PORTS_PARAM) {
            for part in list.split(',').filter(|p| !p.is_empty()) {
                let port = part
                    .parse::<u16>()
                    .map_err(|_| RequestError::InvalidPort(part.to_string()))?;
                ports.push(port);
            }
        } else if let Some(port) = uri.port {
            ports.push(port);
        }
        if ports.is_empty() {
            return Err(RequestError::NoPorts);
        }
        let transfer_id = uri.query_param(TRANSFER_ID_PARAM).unwrap_or("").to_string();
        if transfer_id.len() > MAX_TRANSFER_ID_LENGTH {
            return Err(RequestError::TransferIdTooLong);
        }
        let protocol_version = match uri.query_param(PROTOCOL_PARAM) {
            Some(raw) => raw
                .parse::<i32>()
                .map_err(|_| RequestError::InvalidProtocol(raw.to_string()))?,
            None => protocol::PROTOCOL_VERSION,
        };
        let encryption = match uri.query_param(ENCRYPTION_PARAM) {
            Some(component) => EncryptionParams::from_uri_component(component)?,
            None => EncryptionParams::none(),
        };
        let directory = PathBuf::from(uri.query_param(DIRECTORY_PARAM).unwrap_or("."));
        Ok(Self {
            host: uri.host,
            ports,
            transfer_id,
            protocol_version,
            encryption,
            directory,
            file_info: Vec::new(),
            disable_directory_traversal: false,
        })
    }

    /// Serialized port list, `p1,p2,...`
    #[must_use]
    pub fn serialized_ports(&self) -> String {
        self.ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn to_uri(&self, with_secret: bool) -> WdtUri {
        let mut params = vec![
            (TRANSFER_ID_PARAM.to_string(), self.transfer_id.clone()),
            (
                PROTOCOL_PARAM.to_string(),
                self.protocol_version.to_string(),
            ),
            (PORTS_PARAM.to_string(), self.serialized_ports()),
            (
                DIRECTORY_PARAM.to_string(),
                self.directory.display().to_string(),
            ),
        ];
        if self.encryption.is_set() {
            let value = if with_secret {
                self.encryption.to_uri_component()
            } else {
                self.encryption.log_safe_string()
            };
            params.push((ENCRYPTION_PARAM.to_string(), value));
        }
        WdtUri {
            host: self.host.clone(),
            port: None,
            params,
        }
    }

    /// Full URL including the encryption secret. Never log this.
    #[must_use]
    pub fn gen_url_with_secret(&self) -> String {
        self.to_uri(true).to_url()
    }

    /// Loggable description with the secret redacted
    #[must_use]
    pub fn log_safe_string(&self) -> String {
        self.to_uri(false).to_url()
    }
}

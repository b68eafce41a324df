//! Encryption parameters and the streaming-cipher capability.
//!
//! The transfer URL carries an `enc=proto:hexkey` component. The session
//! key must never appear in logs; [`EncryptionParams`] redacts it from its
//! `Debug` output and offers a log-safe stringification instead.
//!
//! The cipher itself is a capability: the sender core only needs in-place
//! encrypt/decrypt and an incremental authentication tag accessor for the
//! block footers. Real AEAD implementations are injected through
//! [`CipherProvider`]; the only built-in is the pass-through
//! [`PlainTextCipher`].

use thiserror::Error;
use zeroize::Zeroize;

/// Encryption algorithm tag negotiated out of band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionType {
    /// Clear text
    #[default]
    None,
    /// AES-128 in GCM mode (authenticated, per-block tags)
    Aes128Gcm,
    /// AES-128 in CTR mode (unauthenticated)
    Aes128Ctr,
}

impl EncryptionType {
    /// Name used in the URL `enc=` component
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Aes128Gcm => "aes128gcm",
            Self::Aes128Ctr => "aes128ctr",
        }
    }

    /// Parse the URL name form
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "aes128gcm" => Some(Self::Aes128Gcm),
            "aes128ctr" => Some(Self::Aes128Ctr),
            _ => None,
        }
    }

    /// Length of the authentication tag this algorithm produces, zero when
    /// the mode is unauthenticated
    #[must_use]
    pub fn tag_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::None | Self::Aes128Ctr => 0,
        }
    }
}

/// Errors from encryption parameter handling and cipher construction
#[derive(Debug, Error)]
pub enum CipherError {
    /// The `enc=` URL component could not be parsed
    #[error("malformed encryption parameter: {0}")]
    MalformedParam(String),

    /// A session key is required for this algorithm but missing
    #[error("empty secret for encryption type {0}")]
    EmptySecret(&'static str),

    /// No cipher implementation is available for this algorithm
    #[error("no cipher available for encryption type {0}")]
    Unsupported(&'static str),
}

/// Encryption algorithm plus session key.
///
/// The secret is zeroized on drop and never printed: `Debug` redacts it and
/// [`log_safe_string`](Self::log_safe_string) is the only stringification
/// meant for logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EncryptionParams {
    typ: EncryptionType,
    secret: Vec<u8>,
}

impl EncryptionParams {
    /// Clear-text parameters
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Parameters for `typ` with the given session key.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::EmptySecret`] when an encrypting type comes
    /// with an empty key.
    pub fn new(typ: EncryptionType, secret: Vec<u8>) -> Result<Self, CipherError> {
        if typ != EncryptionType::None && secret.is_empty() {
            return Err(CipherError::EmptySecret(typ.name()));
        }
        Ok(Self { typ, secret })
    }

    /// Algorithm tag
    #[must_use]
    pub fn get_type(&self) -> EncryptionType {
        self.typ
    }

    /// Whether encryption is enabled
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.typ != EncryptionType::None
    }

    /// Session key bytes, for cipher construction only
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// `proto:hexkey` form for the transfer URL; contains the secret
    #[must_use]
    pub fn to_uri_component(&self) -> String {
        format!("{}:{}", self.typ.name(), hex::encode(&self.secret))
    }

    /// Parse the `proto:hexkey` URL component.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MalformedParam`] on an unknown algorithm name
    /// or invalid hex.
    pub fn from_uri_component(component: &str) -> Result<Self, CipherError> {
        // Never echo the component itself; it may contain the secret.
        let (name, hex_key) = component
            .split_once(':')
            .ok_or_else(|| CipherError::MalformedParam("missing separator".to_string()))?;
        let typ = EncryptionType::from_name(name)
            .ok_or_else(|| CipherError::MalformedParam(name.to_string()))?;
        let secret = hex::decode(hex_key)
            .map_err(|_| CipherError::MalformedParam(name.to_string()))?;
        Self::new(typ, secret)
    }

    /// Stringification safe to log: algorithm and key length only
    #[must_use]
    pub fn log_safe_string(&self) -> String {
        format!("{}:<{} byte key>", self.typ.name(), self.secret.len())
    }
}

impl Drop for EncryptionParams {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for EncryptionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionParams")
            .field("type", &self.typ)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Symmetric streaming cipher driving one connection.
///
/// Both directions run through the same object; the write half keeps an
/// incremental authentication tag that the sender samples after each block
/// for the `ENC_TAG` footer.
pub trait StreamCipher: Send {
    /// Encrypt outgoing bytes in place
    fn encrypt(&mut self, data: &mut [u8]);

    /// Decrypt incoming bytes in place
    fn decrypt(&mut self, data: &mut [u8]);

    /// Current incremental authentication tag of the write stream; empty
    /// for unauthenticated modes
    fn compute_cur_tag(&mut self) -> Vec<u8>;
}

/// Pass-through cipher used for clear-text transfers
#[derive(Debug, Default)]
pub struct PlainTextCipher;

impl StreamCipher for PlainTextCipher {
    fn encrypt(&mut self, _data: &mut [u8]) {}

    fn decrypt(&mut self, _data: &mut [u8]) {}

    fn compute_cur_tag(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

/// Capability constructing a cipher pair for a connection
pub trait CipherProvider: Send + Sync {
    /// Build the cipher for one connection.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError`] when the algorithm is unsupported or the
    /// parameters are unusable.
    fn make_cipher(&self, params: &EncryptionParams)
    -> Result<Box<dyn StreamCipher>, CipherError>;
}

/// Provider that only supports clear text; the default when no real
/// cipher implementation is injected
#[derive(Debug, Default)]
pub struct PlainTextProvider;

impl CipherProvider for PlainTextProvider {
    fn make_cipher(
        &self,
        params: &EncryptionParams,
    ) -> Result<Box<dyn StreamCipher>, CipherError> {
        match params.get_type() {
            EncryptionType::None => Ok(Box::new(PlainTextCipher)),
            other => Err(CipherError::Unsupported(other.name())),
        }
    }
}

//! Shared-secret authentication for inbound webhooks.
//!
//! Requests are signed with HMAC-SHA1 over the raw body and carry the
//! result in the `X-Hub-Signature` header as `sha1=<lowercase-hex>`.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";
pub const SIGNATURE_PREFIX: &str = "sha1=";

/// Key material for request signatures.
///
/// Only the keyed MAC state is retained, and `Debug` never prints it.
#[derive(Clone)]
pub struct Secret {
    mac: HmacSha1,
}

impl Secret {
    /// Returns `None` for an empty key, which callers treat as "no secret".
    pub fn new(key: impl AsRef<[u8]>) -> Option<Self> {
        let key = key.as_ref();
        if key.is_empty() {
            return None;
        }
        let mac = HmacSha1::new_from_slice(key).ok()?;
        Some(Self { mac })
    }

    /// Loads the key from `path`. A file that is blank after trimming is a
    /// configuration error; otherwise the raw bytes are the key.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read secret file {}", path.display()))?;
        if raw.trim_ascii().is_empty() {
            anyhow::bail!("secret file {} is empty", path.display());
        }
        Self::new(&raw)
            .with_context(|| format!("secret file {} is not a usable key", path.display()))
    }

    /// Formats the signature of `body` as `sha1=<lowercase-hex>`.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingSignature,
    SignatureMismatch,
    UnverifiableSignature,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSignature => {
                write!(f, "secret configured but no {SIGNATURE_HEADER} header")
            }
            Self::SignatureMismatch => write!(f, "body did not validate against {SIGNATURE_HEADER}"),
            Self::UnverifiableSignature => write!(
                f,
                "signed hook but no local secret (run with --secret-file or --no-secret)"
            ),
        }
    }
}

impl std::error::Error for Rejection {}

#[derive(Debug, Clone)]
pub enum Authenticator {
    Secret(Secret),
    NoSecret { tolerate_signed: bool },
}

impl Authenticator {
    pub fn new(secret: Option<Secret>, tolerate_signed: bool) -> Self {
        match secret {
            Some(secret) => Self::Secret(secret),
            None => Self::NoSecret { tolerate_signed },
        }
    }

    pub fn has_secret(&self) -> bool {
        matches!(self, Self::Secret(_))
    }

    /// Decides whether a request may run the command. `signature` is the
    /// raw header value; an empty value counts as absent.
    pub fn authenticate(&self, body: &[u8], signature: Option<&[u8]>) -> Result<(), Rejection> {
        let signature = signature.filter(|value| !value.is_empty());
        match self {
            Self::Secret(secret) => {
                let signature = signature.ok_or(Rejection::MissingSignature)?;
                let expected = secret.sign(body);
                if bool::from(expected.as_bytes().ct_eq(signature)) {
                    Ok(())
                } else {
                    Err(Rejection::SignatureMismatch)
                }
            }
            Self::NoSecret { tolerate_signed: true } => Ok(()),
            Self::NoSecret { tolerate_signed: false } => match signature {
                Some(_) => Err(Rejection::UnverifiableSignature),
                None => Ok(()),
            },
        }
    }
}

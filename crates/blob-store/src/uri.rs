//! Blob addresses and credential sources.

use std::fmt;

use crate::StoreError;

/// Query parameter that carries a pre-signed, short-lived signature.
const SIGNATURE_PARAM: &str = "sig";

/// Address of a single blob: `scheme://host[:port]/container/name[?query]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobUri {
    raw: String,
    endpoint: String,
    path: String,
    query: Option<String>,
}

impl BlobUri {
    /// Parses a blob URI.
    ///
    /// The path must name at least one segment below the endpoint.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| StoreError::InvalidUri(format!("missing scheme: {raw}")))?;
        if scheme.is_empty() {
            return Err(StoreError::InvalidUri(format!("empty scheme: {raw}")));
        }

        let (before_query, query) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q.to_string())),
            None => (rest, None),
        };
        let (host, path) = before_query.split_once('/').unwrap_or((before_query, ""));
        if host.is_empty() {
            return Err(StoreError::InvalidUri(format!("missing host: {raw}")));
        }
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(StoreError::InvalidUri(format!("missing blob path: {raw}")));
        }

        Ok(Self {
            raw: raw.to_string(),
            endpoint: format!("{scheme}://{host}"),
            path: path.to_string(),
            query,
        })
    }

    /// `scheme://host[:port]`; the unit of connection tuning.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Blob path below the endpoint, without leading or trailing slashes.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The URI exactly as it was parsed.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns `true` if the URI embeds a pre-signed signature.
    pub fn has_signature(&self) -> bool {
        self.query.as_deref().is_some_and(|q| {
            q.split('&')
                .any(|pair| pair.split('=').next() == Some(SIGNATURE_PARAM))
        })
    }

    /// The last path segment, handy as a display name.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for BlobUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A long-lived credential supplied outside the URI.
///
/// Mutually exclusive with a signature embedded in the [`BlobUri`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credential {
    /// Rely on the URI alone (signed or public).
    #[default]
    None,
    /// An ambient static credential, e.g. an account key or bearer token.
    Ambient(String),
}

impl Credential {
    pub fn is_ambient(&self) -> bool {
        matches!(self, Self::Ambient(_))
    }
}

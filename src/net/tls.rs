//! TLS trust configuration and certificate loading.
//!
//! # Responsibilities
//! - Resolve a trust-store specification into a [`TrustConfig`]
//! - Load the listener's server identity (certificate chain + key)
//! - Build the rustls `ServerConfig`, optionally requiring client certificates
//!
//! # Trust-store specifications
//! ```text
//! ""                                  → system defaults
//! {"content": "<prefix>,<base64>"}    → inline content object
//! "-----BEGIN CERTIFICATE----- ..."   → inline PEM (single-line tolerated)
//! "base64,<data>"                     → inline encoded content
//! anything else                       → directory of PEM files
//! ```
//!
//! # Design Decisions
//! - Pure functions, no caching; callers keep the returned config
//! - Directory scans skip unreadable or non-certificate files and only fail
//!   when nothing usable was found

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

const PEM_MARKER: &str = "-----BEGIN";

/// Certificate and trust-store failures.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("certificate content is missing or invalid: {0}")]
    ContentInvalid(String),

    #[error("trust store [{}] does not exist", .0.display())]
    TrustStoreNotFound(PathBuf),

    #[error("trust store [{}] is not a directory", .0.display())]
    TrustStoreNotADirectory(PathBuf),

    #[error("no valid certificates found in trust store [{}]", .0.display())]
    TrustStoreEmpty(PathBuf),

    #[error("failed to parse certificate: {0}")]
    ParseError(String),

    #[error("failed to read [{}]: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid server identity: {0}")]
    Identity(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Trust configuration handed to the dial policy and the listener.
///
/// Immutable once built; clones share the same root store.
#[derive(Debug, Clone, Default)]
pub struct TrustConfig {
    pub skip_verify: bool,
    roots: Option<Arc<RootCertStore>>,
}

impl TrustConfig {
    /// No custom roots; the bundled web PKI roots apply.
    pub fn system_default() -> Self {
        Self::default()
    }

    /// Skip peer verification entirely.
    pub fn insecure() -> Self {
        Self {
            skip_verify: true,
            roots: None,
        }
    }

    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            skip_verify: false,
            roots: Some(Arc::new(roots)),
        }
    }

    /// Custom roots, if any were loaded.
    pub fn custom_roots(&self) -> Option<&Arc<RootCertStore>> {
        self.roots.as_ref()
    }

    /// The root store to verify against: custom roots or the web PKI bundle.
    pub fn root_store(&self) -> Arc<RootCertStore> {
        match &self.roots {
            Some(roots) => Arc::clone(roots),
            None => Arc::new(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            }),
        }
    }
}

/// Resolve a trust-store specification.
pub fn load_trust(spec: &str) -> Result<TrustConfig, CertificateError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(TrustConfig::system_default());
    }
    if spec.starts_with('{') {
        return load_content_object(spec);
    }
    if is_inline(spec) {
        return load_inline(spec);
    }
    load_directory(Path::new(spec))
}

/// The process-wide crypto provider, falling back to aws-lc-rs.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn is_inline(spec: &str) -> bool {
    spec.contains(PEM_MARKER) || encoding_prefix(spec).is_some()
}

/// Split `"<encoding>,<data>"`, where the encoding is a bare token.
fn encoding_prefix(spec: &str) -> Option<(&str, &str)> {
    let (prefix, data) = spec.split_once(',')?;
    let is_token = !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    is_token.then_some((prefix, data))
}

fn load_content_object(spec: &str) -> Result<TrustConfig, CertificateError> {
    let value: serde_json::Value = serde_json::from_str(spec)
        .map_err(|e| CertificateError::ContentInvalid(format!("not a content object: {e}")))?;
    let content = value
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| CertificateError::ContentInvalid("no content field".into()))?;

    let encoded = content.split_once(',').map_or(content, |(_, data)| data);
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CertificateError::ContentInvalid(e.to_string()))?;
    let certs = certificates_from_bytes(&bytes).map_err(CertificateError::ContentInvalid)?;
    pool_from(certs).map_err(CertificateError::ContentInvalid)
}

fn load_inline(spec: &str) -> Result<TrustConfig, CertificateError> {
    let certs = if let Some((encoding, data)) = encoding_prefix(spec) {
        if !encoding.eq_ignore_ascii_case("base64") {
            return Err(CertificateError::ParseError(format!(
                "unsupported encoding [{encoding}]"
            )));
        }
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| CertificateError::ParseError(e.to_string()))?;
        certificates_from_bytes(&bytes)
    } else {
        certificates_from_bytes(normalize_pem(spec).as_bytes())
    };
    let certs = certs.map_err(CertificateError::ParseError)?;
    pool_from(certs).map_err(CertificateError::ParseError)
}

fn load_directory(path: &Path) -> Result<TrustConfig, CertificateError> {
    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CertificateError::TrustStoreNotFound(path.to_path_buf()),
        _ => CertificateError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    if !metadata.is_dir() {
        return Err(CertificateError::TrustStoreNotADirectory(path.to_path_buf()));
    }

    let entries = fs::read_dir(path).map_err(|e| CertificateError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut store = RootCertStore::empty();
    for entry in entries {
        let file = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                tracing::warn!(dir = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !file.is_file() {
            continue;
        }
        let bytes = match fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };
        let mut reader = bytes.as_slice();
        let certs = rustls_pemfile::certs(&mut reader).filter_map(Result::ok);
        let (added, ignored) = store.add_parsable_certificates(certs);
        tracing::debug!(file = %file.display(), added, ignored, "Scanned trust-store file");
    }

    if store.is_empty() {
        return Err(CertificateError::TrustStoreEmpty(path.to_path_buf()));
    }
    tracing::info!(dir = %path.display(), roots = store.len(), "Loaded trust store");
    Ok(TrustConfig::with_roots(store))
}

/// PEM if the bytes carry armor, otherwise a single DER certificate.
fn certificates_from_bytes(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, String> {
    let armored = bytes
        .windows(PEM_MARKER.len())
        .any(|w| w == PEM_MARKER.as_bytes());
    if !armored {
        return Ok(vec![CertificateDer::from(bytes.to_vec())]);
    }
    let certs = rustls_pemfile::certs(&mut &bytes[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    if certs.is_empty() {
        return Err("no certificate blocks found".into());
    }
    Ok(certs)
}

fn pool_from(certs: Vec<CertificateDer<'static>>) -> Result<TrustConfig, String> {
    let mut store = RootCertStore::empty();
    for cert in certs {
        store.add(cert).map_err(|e| e.to_string())?;
    }
    Ok(TrustConfig::with_roots(store))
}

/// Put boundary markers and base64 bodies back on their own lines.
///
/// Handles PEM that was flattened onto a single line, e.g. pasted into an
/// environment variable.
fn normalize_pem(raw: &str) -> String {
    fn push_body(out: &mut String, body: &str) {
        let joined: String = body.split_whitespace().collect();
        if !joined.is_empty() {
            out.push_str(&joined);
            out.push('\n');
        }
    }

    let mut out = String::with_capacity(raw.len() + 8);
    let mut rest = raw.trim();
    while let Some(start) = rest.find("-----") {
        push_body(&mut out, &rest[..start]);
        let after = &rest[start + 5..];
        let Some(end) = after.find("-----") else {
            break;
        };
        let label = after[..end].split_whitespace().collect::<Vec<_>>().join(" ");
        out.push_str("-----");
        out.push_str(&label);
        out.push_str("-----\n");
        rest = &after[end + 5..];
    }
    push_body(&mut out, rest);
    out
}

/// Certificate chain and private key for a listener.
#[derive(Debug)]
pub struct ServerIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    /// Load from PEM files or inline PEM text.
    pub fn load(cert: &str, key: &str) -> Result<Self, CertificateError> {
        let cert_pem = read_pem_source(cert)?;
        let key_pem = read_pem_source(key)?;

        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertificateError::Identity(e.to_string()))?;
        if certs.is_empty() {
            return Err(CertificateError::Identity("no certificate in chain".into()));
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| CertificateError::Identity(e.to_string()))?
            .ok_or_else(|| CertificateError::Identity("no private key found".into()))?;

        Ok(Self { certs, key })
    }
}

fn read_pem_source(source: &str) -> Result<Vec<u8>, CertificateError> {
    if source.contains(PEM_MARKER) {
        return Ok(normalize_pem(source).into_bytes());
    }
    fs::read(source).map_err(|e| CertificateError::Io {
        path: PathBuf::from(source),
        source: e,
    })
}

/// Build the listener's rustls config.
///
/// With `client_trust`, peers must present a certificate chaining to it.
pub fn server_config(
    identity: ServerIdentity,
    client_trust: Option<&TrustConfig>,
) -> Result<Arc<ServerConfig>, CertificateError> {
    let provider = crypto_provider();
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let mut config = match client_trust {
        Some(trust) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(trust.root_store(), provider)
                .build()
                .map_err(|e| CertificateError::Identity(e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(identity.certs, identity.key)?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(identity.certs, identity.key)?,
    };

    // WebSocket upgrades ride on HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

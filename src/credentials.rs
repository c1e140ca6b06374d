//! Credential store with atomic snapshot publication and periodic refresh
//!
//! A snapshot is built from the keystore archive once at startup and
//! republished on a fixed cadence by the refresher task. Handshakes read
//! whichever snapshot was current when they started; publication is a
//! single atomic pointer swap, never an in-place mutation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::keystore::{self, KeyStore, KeystoreError};

/// Signature-algorithm family of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// ECDSA-signed certificate.
    Ecdsa,
    /// RSA-signed certificate.
    Rsa,
}

impl KeyAlgorithm {
    /// The alias suffix for this family.
    pub fn suffix(self) -> &'static str {
        match self {
            KeyAlgorithm::Ecdsa => "ECDSA",
            KeyAlgorithm::Rsa => "RSA",
        }
    }
}

/// A certificate chain plus its private key, ready for the TLS handshake.
#[derive(Clone)]
pub struct CertEntry {
    /// Chain and signing key in rustls form.
    pub key: Arc<CertifiedKey>,
    /// Algorithm family, derived from the alias suffix.
    pub algorithm: KeyAlgorithm,
}

impl std::fmt::Debug for CertEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertEntry")
            .field("algorithm", &self.algorithm)
            .field("chain_len", &self.key.cert.len())
            .finish()
    }
}

/// Errors raised while building a credential snapshot.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The archive could not be read or decoded.
    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    /// No `default:*` alias exists in the archive at all.
    #[error(
        "no certificate exists with the \"default\" alias; \
         load a cert with a default alias into the keystore"
    )]
    NoDefaultAlias,

    /// Default aliases were present but none of their keys were usable.
    #[error("no usable default credential after key decode")]
    NoUsableDefault,
}

/// Immutable snapshot of every credential the proxy can serve.
///
/// Default entries are held in quick-access slots rather than the alias
/// map, since they are consulted on every handshake that misses the map.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: HashMap<String, CertEntry>,
    default_ecdsa: Option<CertEntry>,
    default_rsa: Option<CertEntry>,
}

impl CredentialStore {
    /// Build a snapshot from a decoded archive.
    ///
    /// Entries whose private key fails to parse are dropped with a warning;
    /// the load as a whole fails only when the default-credential
    /// invariants cannot be met.
    pub fn from_keystore(store: &KeyStore) -> Result<Self, CredentialError> {
        if !store.has_default_alias() {
            return Err(CredentialError::NoDefaultAlias);
        }

        let mut out = CredentialStore::default();
        for (alias, entry) in &store.entries {
            if entry.cert_chain.is_empty() {
                warn!(alias = %alias, "entry has no certificate chain; skipping");
                continue;
            }
            let signing_key = match keystore::decode_private_key(&entry.key_pem) {
                Ok(k) => k,
                Err(e) => {
                    warn!(alias = %alias, error = %e, "private key load failed; skipping");
                    continue;
                }
            };
            let chain: Vec<CertificateDer<'static>> = entry
                .cert_chain
                .iter()
                .map(|c| CertificateDer::from(c.content.clone()))
                .collect();
            let cert_entry = CertEntry {
                key: Arc::new(CertifiedKey::new(chain, signing_key)),
                algorithm: alias_algorithm(alias),
            };

            if alias.starts_with("default") {
                // The suffix decides the slot; anything that is not ECDSA
                // lands in the RSA slot, as the original store did.
                if alias.ends_with(":ECDSA") {
                    out.default_ecdsa = Some(cert_entry);
                } else {
                    out.default_rsa = Some(cert_entry);
                }
            } else {
                out.entries.insert(alias.clone(), cert_entry);
            }
        }

        if out.default_ecdsa.is_none() && out.default_rsa.is_none() {
            return Err(CredentialError::NoUsableDefault);
        }
        Ok(out)
    }

    /// Look up a non-default credential by its full alias.
    pub fn get(&self, alias: &str) -> Option<&CertEntry> {
        self.entries.get(alias)
    }

    /// The default credential for an algorithm family, if loaded.
    pub fn default_for(&self, alg: KeyAlgorithm) -> Option<&CertEntry> {
        match alg {
            KeyAlgorithm::Ecdsa => self.default_ecdsa.as_ref(),
            KeyAlgorithm::Rsa => self.default_rsa.as_ref(),
        }
    }

    /// Number of non-default entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no credential of any kind is loaded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.default_ecdsa.is_none() && self.default_rsa.is_none()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&mut self, alias: &str, entry: CertEntry) {
        if alias.starts_with("default") {
            if alias.ends_with(":ECDSA") {
                self.default_ecdsa = Some(entry);
            } else {
                self.default_rsa = Some(entry);
            }
        } else {
            self.entries.insert(alias.to_string(), entry);
        }
    }
}

/// Algorithm family implied by an alias suffix. Aliases without the ECDSA
/// suffix are assumed RSA, matching the original store's behavior.
fn alias_algorithm(alias: &str) -> KeyAlgorithm {
    if alias.ends_with(":ECDSA") {
        KeyAlgorithm::Ecdsa
    } else {
        KeyAlgorithm::Rsa
    }
}

/// Shared handle to the current credential snapshot.
///
/// The refresher is the only writer; every reader (one per handshake)
/// loads the pointer once and keeps its `Arc` for the duration.
pub struct CredentialsHandle {
    current: ArcSwap<CredentialStore>,
}

impl CredentialsHandle {
    /// Wrap an initial snapshot.
    pub fn new(store: CredentialStore) -> Self {
        Self {
            current: ArcSwap::from_pointee(store),
        }
    }

    /// The snapshot current at this instant.
    pub fn snapshot(&self) -> Arc<CredentialStore> {
        self.current.load_full()
    }

    /// Atomically publish a new snapshot.
    pub fn publish(&self, store: CredentialStore) {
        self.current.store(Arc::new(store));
    }

    /// Replace the snapshot with an empty store. Used at shutdown so the
    /// process does not sit on key material while exiting.
    pub fn clear(&self) {
        self.current.store(Arc::new(CredentialStore::default()));
    }
}

impl std::fmt::Debug for CredentialsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.current.load();
        f.debug_struct("CredentialsHandle")
            .field("entries", &snap.len())
            .finish()
    }
}

/// Read the archive from disk and build a fresh snapshot.
pub fn load_credentials(
    path: &std::path::Path,
    password: &[u8],
) -> Result<CredentialStore, CredentialError> {
    let keystore = keystore::load(path, password)?;
    CredentialStore::from_keystore(&keystore)
}

/// Spawn the background refresher.
///
/// Every `period` the archive is re-read and, on success, published as a
/// whole-snapshot swap. Failures are logged and the previous snapshot
/// stays in service. The task stops when the `stop` channel fires or its
/// sender is dropped.
pub fn spawn_refresher(
    handle: Arc<CredentialsHandle>,
    keystore_path: PathBuf,
    password: Arc<Zeroizing<Vec<u8>>>,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick of an interval fires immediately; the initial
        // load already happened at startup, so consume it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("credential refresher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match load_credentials(&keystore_path, &password) {
                        Ok(store) => {
                            info!(
                                entries = store.len(),
                                "credential snapshot refreshed"
                            );
                            handle.publish(store);
                        }
                        Err(e) => {
                            error!(error = %e, "keystore reload failed; keeping previous snapshot");
                        }
                    }
                }
            }
        }
    })
}

//! Per-handshake certificate selection
//!
//! Picks a credential for each ClientHello from the SNI value and the
//! cipher suites the client offered. Host-specific entries win over the
//! defaults, and ECDSA wins over RSA. Whether the client can handle a
//! given signature algorithm is inferred from the cipher-suite lists
//! below; the `signature_algorithms` extension is deliberately ignored to
//! keep selection behavior stable across client stacks.

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use crate::credentials::{CredentialStore, CredentialsHandle, KeyAlgorithm};

/// IANA cipher-suite code points whose server authentication is ECDSA.
pub const ECDSA_CIPHER_SUITES: [u16; 13] = [
    0xC007, 0xC008, 0xC009, 0xC00A, 0xC023, 0xC024, 0xC025, 0xC026, 0xC02B, 0xC02C, 0xC02D,
    0xC02E, 0xCCA9,
];

/// IANA cipher-suite code points whose server authentication is RSA.
pub const RSA_CIPHER_SUITES: [u16; 16] = [
    0x0005, 0x000A, 0x002F, 0x0035, 0x003C, 0x009C, 0x009D, 0xC011, 0xC012, 0xC013, 0xC014,
    0xC027, 0xC028, 0xC02F, 0xC030, 0xCCA8,
];

/// Whether the offered suites allow authentication with `alg`.
pub fn client_supports(offered: &[u16], alg: KeyAlgorithm) -> bool {
    let table: &[u16] = match alg {
        KeyAlgorithm::Ecdsa => &ECDSA_CIPHER_SUITES,
        KeyAlgorithm::Rsa => &RSA_CIPHER_SUITES,
    };
    offered.iter().any(|suite| table.contains(suite))
}

/// Choose a credential for one handshake.
///
/// Pure with respect to the snapshot: the caller fixes the store, the SNI
/// value (empty or missing SNI falls back to the `default` alias) and the
/// offered suites, and the same inputs always yield the same choice.
///
/// A host-specific entry that the client cannot use also rules its
/// algorithm family out of the default fallback: the client has already
/// proven it cannot authenticate that family.
pub fn select(
    store: &CredentialStore,
    server_name: Option<&str>,
    offered: &[u16],
) -> Option<Arc<CertifiedKey>> {
    let alias = match server_name {
        Some(name) if !name.is_empty() => name,
        _ => "default",
    };

    let supports_ecdsa = client_supports(offered, KeyAlgorithm::Ecdsa);
    let supports_rsa = client_supports(offered, KeyAlgorithm::Rsa);

    let mut ecdsa_ruled_out = false;
    let mut rsa_ruled_out = false;

    if let Some(entry) = store.get(&format!("{alias}:ECDSA")) {
        if supports_ecdsa {
            return Some(entry.key.clone());
        }
        ecdsa_ruled_out = true;
    }
    if let Some(entry) = store.get(&format!("{alias}:RSA")) {
        if supports_rsa {
            return Some(entry.key.clone());
        }
        rsa_ruled_out = true;
    }

    if !ecdsa_ruled_out && supports_ecdsa {
        if let Some(entry) = store.default_for(KeyAlgorithm::Ecdsa) {
            return Some(entry.key.clone());
        }
    }
    if !rsa_ruled_out && supports_rsa {
        if let Some(entry) = store.default_for(KeyAlgorithm::Rsa) {
            return Some(entry.key.clone());
        }
    }

    None
}

/// rustls hook wiring [`select`] into the handshake.
///
/// Loads the snapshot pointer once per handshake; concurrent refreshes
/// never affect a handshake already in flight.
pub struct SniCertSelector {
    credentials: Arc<CredentialsHandle>,
}

impl SniCertSelector {
    /// Build a selector over the shared credential handle.
    pub fn new(credentials: Arc<CredentialsHandle>) -> Self {
        Self { credentials }
    }
}

impl std::fmt::Debug for SniCertSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertSelector").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertSelector {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.credentials.snapshot();
        let offered: Vec<u16> = client_hello
            .cipher_suites()
            .iter()
            .map(|suite| u16::from(*suite))
            .collect();
        let server_name = client_hello.server_name();

        let chosen = select(&snapshot, server_name, &offered);
        if chosen.is_none() {
            warn!(
                sni = server_name.unwrap_or("<none>"),
                suites = offered.len(),
                "no certificate to serve for this ClientHello"
            );
        } else {
            debug!(sni = server_name.unwrap_or("<none>"), "certificate selected");
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CertEntry;
    use rustls::pki_types::CertificateDer;
    use rustls::sign::SigningKey;
    use rustls::{SignatureAlgorithm, SignatureScheme};

    /// Stand-in signing key so selection tests need no real key material.
    #[derive(Debug)]
    struct StubKey(SignatureAlgorithm);

    impl SigningKey for StubKey {
        fn choose_scheme(
            &self,
            _offered: &[SignatureScheme],
        ) -> Option<Box<dyn rustls::sign::Signer>> {
            None
        }

        fn algorithm(&self) -> SignatureAlgorithm {
            self.0
        }
    }

    fn entry(alg: KeyAlgorithm, marker: u8) -> CertEntry {
        let sig_alg = match alg {
            KeyAlgorithm::Ecdsa => SignatureAlgorithm::ECDSA,
            KeyAlgorithm::Rsa => SignatureAlgorithm::RSA,
        };
        CertEntry {
            key: Arc::new(CertifiedKey::new(
                vec![CertificateDer::from(vec![marker])],
                Arc::new(StubKey(sig_alg)),
            )),
            algorithm: alg,
        }
    }

    /// The single DER byte planted by `entry`, to identify which
    /// credential the selector picked.
    fn marker(key: &Arc<CertifiedKey>) -> u8 {
        key.cert[0].as_ref()[0]
    }

    fn store_with_example_com() -> CredentialStore {
        let mut store = CredentialStore::default();
        store.insert_for_test("example.com:ECDSA", entry(KeyAlgorithm::Ecdsa, 1));
        store.insert_for_test("example.com:RSA", entry(KeyAlgorithm::Rsa, 2));
        store
    }

    #[test]
    fn sni_present_ecdsa_preferred() {
        let store = store_with_example_com();
        let chosen = select(&store, Some("example.com"), &[0xC02B, 0x009C]).unwrap();
        assert_eq!(marker(&chosen), 1);
    }

    #[test]
    fn sni_present_rsa_only_client() {
        let store = store_with_example_com();
        let chosen = select(&store, Some("example.com"), &[0x009C]).unwrap();
        assert_eq!(marker(&chosen), 2);
    }

    #[test]
    fn missing_sni_uses_default() {
        let mut store = CredentialStore::default();
        store.insert_for_test("default:RSA", entry(KeyAlgorithm::Rsa, 3));
        let chosen = select(&store, None, &[0x009C]).unwrap();
        assert_eq!(marker(&chosen), 3);

        let chosen = select(&store, Some(""), &[0x009C]).unwrap();
        assert_eq!(marker(&chosen), 3);
    }

    #[test]
    fn unknown_sni_falls_back_to_default() {
        let mut store = store_with_example_com();
        store.insert_for_test("default:ECDSA", entry(KeyAlgorithm::Ecdsa, 4));
        let chosen = select(&store, Some("nope.invalid"), &[0xC02B]).unwrap();
        assert_eq!(marker(&chosen), 4);
    }

    #[test]
    fn no_matching_suites_fails_selection() {
        let mut store = store_with_example_com();
        store.insert_for_test("default:RSA", entry(KeyAlgorithm::Rsa, 5));
        // 0x1301 is TLS_AES_128_GCM_SHA256, in neither table.
        assert!(select(&store, Some("example.com"), &[0x1301]).is_none());
        assert!(select(&store, Some("example.com"), &[]).is_none());
    }

    #[test]
    fn host_miss_rules_family_out_of_default_fallback() {
        // Host has an ECDSA cert the client cannot use; the ECDSA default
        // must be skipped even though the client's suite list would never
        // match it anyway. The RSA default is still eligible.
        let mut store = CredentialStore::default();
        store.insert_for_test("example.com:ECDSA", entry(KeyAlgorithm::Ecdsa, 1));
        store.insert_for_test("default:ECDSA", entry(KeyAlgorithm::Ecdsa, 6));
        store.insert_for_test("default:RSA", entry(KeyAlgorithm::Rsa, 7));

        let chosen = select(&store, Some("example.com"), &[0x009C]).unwrap();
        assert_eq!(marker(&chosen), 7);
    }

    #[test]
    fn ruled_out_family_with_no_alternative_fails() {
        // RSA-only host entry, ECDSA-only client: RSA is ruled out by the
        // host miss and no ECDSA credential exists anywhere.
        let mut store = CredentialStore::default();
        store.insert_for_test("example.com:RSA", entry(KeyAlgorithm::Rsa, 1));
        store.insert_for_test("default:RSA", entry(KeyAlgorithm::Rsa, 2));
        assert!(select(&store, Some("example.com"), &[0xC02B]).is_none());
    }

    #[test]
    fn cipher_tables_match_classification() {
        for suite in ECDSA_CIPHER_SUITES {
            assert!(client_supports(&[suite], KeyAlgorithm::Ecdsa));
        }
        for suite in RSA_CIPHER_SUITES {
            assert!(client_supports(&[suite], KeyAlgorithm::Rsa));
        }
        assert!(!client_supports(&[0x1301, 0x1302], KeyAlgorithm::Ecdsa));
        assert!(!client_supports(&[0x1301, 0x1302], KeyAlgorithm::Rsa));
    }
}

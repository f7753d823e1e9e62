//! Revocation evidence gathered during validation, kept for embedding into
//! the document so the signature can be validated again later without
//! network access.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::certificate::CertId;
use crate::chain::CertificateChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EvidenceKind {
    Crl,
    Ocsp,
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceKind::Crl => f.write_str("CRL"),
            EvidenceKind::Ocsp => f.write_str("OCSP response"),
        }
    }
}

/// An encoded CRL or OCSP response, and the certificates it speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEvidence {
    pub kind: EvidenceKind,
    pub der: Arc<[u8]>,
    pub covers: BTreeSet<CertId>,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    /// SHA-256 of `der`.
    pub digest: [u8; 32],
}

impl RevocationEvidence {
    pub fn new(
        kind: EvidenceKind,
        der: &[u8],
        covers: CertId,
        this_update: DateTime<Utc>,
        next_update: Option<DateTime<Utc>>,
    ) -> Self {
        RevocationEvidence {
            kind,
            der: Arc::from(der),
            covers: BTreeSet::from([covers]),
            this_update,
            next_update,
            digest: Sha256::digest(der).into(),
        }
    }
}

/// Evidence per certificate.
///
/// Appends for different certificates never contend; appends for the same
/// certificate are serialized by the map's entry lock.
#[derive(Debug, Default)]
pub struct EvidenceStore {
    items: DashMap<CertId, Vec<RevocationEvidence>>,
}

impl EvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `evidence` for `cert`. Every distinct artifact is kept, a CRL
    /// and an OCSP response for the same certificate included. Recording
    /// the very same artifact twice is a no-op.
    pub fn record(&self, cert: CertId, evidence: RevocationEvidence) {
        let mut entry = self.items.entry(cert).or_default();
        if entry.iter().any(|known| known.digest == evidence.digest) {
            return;
        }
        log::debug!("recorded {} for certificate {cert}", evidence.kind);
        entry.push(evidence);
    }

    pub fn get(&self, cert: &CertId) -> Vec<RevocationEvidence> {
        self.items
            .get(cert)
            .map(|items| items.value().clone())
            .unwrap_or_default()
    }

    pub fn has_evidence(&self, cert: &CertId) -> bool {
        self.items.get(cert).is_some_and(|items| !items.is_empty())
    }

    pub fn len(&self) -> usize {
        self.items.iter().map(|entry| entry.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves everything recorded in `other` into this store.
    pub fn absorb(&self, other: EvidenceStore) {
        for (cert, items) in other.items {
            for evidence in items {
                self.record(cert, evidence);
            }
        }
    }

    /// Evidence for embedding, in chain order (leaf first).
    pub fn export_for(&self, chain: &CertificateChain) -> Vec<RevocationEvidence> {
        self.export_ordered(chain.ids())
    }

    /// Evidence for the given certificates, in the given order.
    ///
    /// Artifacts covering several certificates appear once, at the position
    /// of the first certificate they cover, with their covered sets merged.
    /// Within one certificate, artifacts are sorted by kind and content, so
    /// the output does not depend on the order resolvers finished in.
    pub fn export_ordered(&self, certs: impl IntoIterator<Item = CertId>) -> Vec<RevocationEvidence> {
        let mut exported: Vec<RevocationEvidence> = Vec::new();
        let mut position: HashMap<[u8; 32], usize> = HashMap::new();

        for cert in certs {
            let mut items = self.get(&cert);
            items.sort_by(|a, b| (a.kind, a.digest).cmp(&(b.kind, b.digest)));
            for evidence in items {
                match position.get(&evidence.digest) {
                    Some(&index) => exported[index].covers.extend(evidence.covers),
                    None => {
                        position.insert(evidence.digest, exported.len());
                        exported.push(evidence);
                    }
                }
            }
        }
        exported
    }
}

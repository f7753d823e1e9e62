//! The certificate store of a validation session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::certificate::{self, CertId, Certificate, DistinguishedName};

#[derive(Default)]
struct Inner {
    by_id: HashMap<CertId, Arc<Certificate>>,
    by_subject: HashMap<DistinguishedName, Vec<CertId>>,
}

/// Append-only collection of every certificate known to a validation
/// session: trust anchors, certificates embedded in the signature or the
/// document, and issuers fetched on the way.
///
/// Adding the same certificate twice is a no-op. It is safe to read and
/// append from several threads at once.
#[derive(Default)]
pub struct CertificateStore {
    inner: RwLock<Inner>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a certificate, returning its identity.
    pub fn add(&self, cert: Certificate) -> CertId {
        let id = cert.id();
        if self.inner.read().by_id.contains_key(&id) {
            return id;
        }

        let mut inner = self.inner.write();
        // Someone may have won the race between the two locks.
        if inner.by_id.contains_key(&id) {
            return id;
        }
        inner
            .by_subject
            .entry(cert.subject().clone())
            .or_default()
            .push(id);
        inner.by_id.insert(id, Arc::new(cert));
        id
    }

    /// Parses and adds a DER encoded certificate.
    pub fn add_der(&self, der: &[u8]) -> Result<CertId, certificate::Error> {
        Ok(self.add(Certificate::from_der(der)?))
    }

    /// All certificates with the given subject, in insertion order.
    pub fn find_by_subject(&self, name: &DistinguishedName) -> Vec<CertId> {
        self.inner
            .read()
            .by_subject
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, id: &CertId) -> Option<Arc<Certificate>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &CertId) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

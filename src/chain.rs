//! Chain-of-trust construction.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::certificate::{self, CertId, Certificate, DistinguishedName};
use crate::config::ValidationConfig;
use crate::fetch::{CancellationToken, Fetcher, Guarded};
use crate::store::CertificateStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("issuer unobtainable for {missing_issuer}")]
    Incomplete { missing_issuer: String },
    #[error("certificate {subject} would appear twice in the chain")]
    Cycle { subject: String },
    #[error("chain longer than {limit} certificates")]
    TooDeep { limit: usize },
}

/// Certificates from the signer (first) up to the certificate that
/// terminated the walk (last).
///
/// Each certificate's issuer name matches the subject of the next one. The
/// signatures along the chain are not checked here.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    certs: Vec<Arc<Certificate>>,
    anchored: bool,
}

impl CertificateChain {
    pub fn leaf(&self) -> &Arc<Certificate> {
        // A chain always holds at least the leaf.
        &self.certs[0]
    }

    /// The last certificate, if it is a trust anchor.
    pub fn anchor(&self) -> Option<&Arc<Certificate>> {
        if self.anchored {
            self.certs.last()
        } else {
            None
        }
    }

    /// Whether the walk ended at a trust anchor, rather than at a
    /// self-issued certificate nobody trusts.
    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    pub fn certificates(&self) -> &[Arc<Certificate>] {
        &self.certs
    }

    pub fn ids(&self) -> impl Iterator<Item = CertId> + '_ {
        self.certs.iter().map(|c| c.id())
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Pairs of (certificate, its issuer) along the chain.
    pub fn links(&self) -> impl Iterator<Item = (&Arc<Certificate>, &Arc<Certificate>)> {
        self.certs.iter().zip(self.certs.iter().skip(1))
    }

    /// The issuer of the certificate at `index`. The last certificate of
    /// the chain is its own issuer.
    pub fn issuer_of(&self, index: usize) -> Option<&Arc<Certificate>> {
        self.certs.get(index + 1).or_else(|| {
            let last = self.certs.last()?;
            (index + 1 == self.certs.len()).then_some(last)
        })
    }

    /// Subject names, leaf first, for reporting.
    pub fn subjects(&self) -> Vec<String> {
        self.certs.iter().map(|c| c.subject().to_string()).collect()
    }
}

/// Tells whether the signature on the first certificate verifies with the
/// key of the second.
pub type LinkCheck<'a> = &'a dyn Fn(&Certificate, &Certificate) -> bool;

/// Builds chains from the certificates of a store, fetching missing issuers
/// through the Authority Information Access extension.
///
/// Among several certificates named like the issuer, the one whose subject
/// key identifier matches the authority key identifier is preferred. With a
/// [`LinkCheck`], candidates whose key does not verify the link are skipped.
pub struct ChainBuilder<'a, F: ?Sized> {
    store: &'a CertificateStore,
    fetcher: Guarded<'a, F>,
    allow_fetch: bool,
    max_depth: usize,
    link_check: Option<LinkCheck<'a>>,
}

impl<'a, F: Fetcher + ?Sized> ChainBuilder<'a, F> {
    pub fn new(
        store: &'a CertificateStore,
        fetcher: &'a F,
        config: &ValidationConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        ChainBuilder {
            store,
            fetcher: Guarded {
                fetcher,
                cancel,
                timeout: config.fetch_timeout,
            },
            allow_fetch: config.allow_fetch,
            max_depth: config.max_chain_depth,
            link_check: None,
        }
    }

    pub fn with_link_check(mut self, check: LinkCheck<'a>) -> Self {
        self.link_check = Some(check);
        self
    }

    /// Walks issuer links from `leaf` until a trust anchor, or a
    /// self-issued certificate, is reached.
    pub fn build(
        &self,
        leaf: &Certificate,
        trust_anchors: &[Certificate],
    ) -> Result<CertificateChain, ChainError> {
        // Anchors go in first so they are preferred among same-named issuers.
        let anchor_subjects: HashSet<&DistinguishedName> = trust_anchors
            .iter()
            .map(|anchor| {
                self.store.add(anchor.clone());
                anchor.subject()
            })
            .collect();

        let leaf_id = self.store.add(leaf.clone());
        let mut current = self
            .store
            .get(&leaf_id)
            .unwrap_or_else(|| Arc::new(leaf.clone()));

        let mut visited = HashSet::from([leaf_id]);
        let mut certs = vec![current.clone()];

        loop {
            if anchor_subjects.contains(current.subject()) {
                log::debug!("chain reached trust anchor {}", current.subject());
                return Ok(CertificateChain {
                    certs,
                    anchored: true,
                });
            }
            if current.is_self_issued() {
                log::debug!("chain ends at untrusted root {}", current.subject());
                return Ok(CertificateChain {
                    certs,
                    anchored: false,
                });
            }
            if certs.len() >= self.max_depth {
                return Err(ChainError::TooDeep {
                    limit: self.max_depth,
                });
            }

            let issuer = self.find_issuer(&current, &visited)?;
            visited.insert(issuer.id());
            certs.push(issuer.clone());
            current = issuer;
        }
    }

    fn find_issuer(
        &self,
        current: &Certificate,
        visited: &HashSet<CertId>,
    ) -> Result<Arc<Certificate>, ChainError> {
        if let Some(found) = self.lookup(current, visited)? {
            return Ok(found);
        }

        // Not known locally: one AIA attempt, then exactly one more lookup.
        if self.allow_fetch && self.fetch_issuer(current) {
            if let Some(found) = self.lookup(current, visited)? {
                return Ok(found);
            }
        }

        Err(ChainError::Incomplete {
            missing_issuer: current.issuer().to_string(),
        })
    }

    /// Looks for an issuer of `current` that is not in the chain yet.
    fn lookup(
        &self,
        current: &Certificate,
        visited: &HashSet<CertId>,
    ) -> Result<Option<Arc<Certificate>>, ChainError> {
        let candidates = self.store.find_by_subject(current.issuer());
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut unvisited: Vec<Arc<Certificate>> = candidates
            .iter()
            .filter(|id| !visited.contains(id))
            .filter_map(|id| self.store.get(id))
            .collect();
        if unvisited.is_empty() {
            return Err(ChainError::Cycle {
                subject: current.issuer().to_string(),
            });
        }
        // Stable, so the store order (anchors first) breaks ties.
        unvisited.sort_by_key(|candidate| key_id_rank(current, candidate));

        if let Some(check) = self.link_check {
            if let Some(pos) = unvisited.iter().position(|c| check(current, c.as_ref())) {
                return Ok(Some(unvisited.swap_remove(pos)));
            }
            log::debug!(
                "no certificate named {} verifies the signature of {}",
                current.issuer(),
                current.subject()
            );
        }
        Ok(unvisited.into_iter().next())
    }

    /// Tries the CA issuer URIs of `current` in order, stopping at the first
    /// one that yields certificates. Returns whether anything was added.
    fn fetch_issuer(&self, current: &Certificate) -> bool {
        for uri in current.ca_issuer_uris() {
            let Ok(bytes) = self.fetcher.fetch(uri) else {
                continue;
            };
            match certificate::parse_certificates(&bytes) {
                Ok(found) => {
                    for cert in found {
                        log::debug!("fetched {} from {uri}", cert.subject());
                        self.store.add(cert);
                    }
                    return true;
                }
                Err(err) => log::warn!(
                    "Unable to parse certificates coming from authority info access \
                     extension ({uri}: {err}). Those won't be included into the \
                     certificate chain."
                ),
            }
        }
        false
    }
}

/// 0 when the key identifiers match, 2 when both are present but differ.
fn key_id_rank(subject: &Certificate, candidate: &Certificate) -> u8 {
    match (subject.authority_key_id(), candidate.subject_key_id()) {
        (Some(wanted), Some(found)) if wanted == found => 0,
        (Some(_), Some(_)) => 2,
        _ => 1,
    }
}

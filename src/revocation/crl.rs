use chrono::{DateTime, Utc};

use super::{
    window_contains, RevocationArtifactError, RevocationResolver, RevocationStatus, StatusSource,
};
use crate::certificate::Certificate;
use crate::evidence::{EvidenceKind, RevocationEvidence};
use crate::fetch::{Fetcher, Guarded};
use crate::provider::CryptoProvider;

/// Revocation status from Certificate Revocation Lists.
///
/// Embedded CRLs are tried first. Then, if fetching is allowed, the CRL
/// distribution points of the subject, in order. The first CRL that covers
/// the subject, verifies against the issuer and is current at the
/// verification date decides.
pub struct CrlResolver<'a, P: ?Sized, F: ?Sized> {
    provider: &'a P,
    fetcher: Guarded<'a, F>,
    allow_fetch: bool,
    embedded: &'a [Vec<u8>],
}

impl<'a, P: CryptoProvider + ?Sized, F: Fetcher + ?Sized> CrlResolver<'a, P, F> {
    pub(crate) fn new(
        provider: &'a P,
        fetcher: Guarded<'a, F>,
        allow_fetch: bool,
        embedded: &'a [Vec<u8>],
    ) -> Self {
        CrlResolver {
            provider,
            fetcher,
            allow_fetch,
            embedded,
        }
    }

    /// Checks a single CRL. Errors carry the reason the CRL was unusable.
    fn check(
        &self,
        der: &[u8],
        subject: &Certificate,
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<RevocationStatus, RevocationArtifactError> {
        let crl = self.provider.decode_crl(der, issuer, at)?;
        if crl.issuer != issuer.subject().as_der() {
            return Err(RevocationArtifactError::NotApplicable);
        }
        if !window_contains(crl.this_update, crl.next_update, at) {
            return Err(RevocationArtifactError::NotCurrent(format!(
                "CRL issued {} does not cover {at}",
                crl.this_update
            )));
        }

        let evidence = RevocationEvidence::new(
            EvidenceKind::Crl,
            der,
            subject.id(),
            crl.this_update,
            crl.next_update,
        );
        let revoked_at = crl.find(subject.serial()).map(|entry| entry.revoked_at);
        Ok(RevocationStatus::from_artifact(
            StatusSource::Crl,
            revoked_at,
            at,
            evidence,
            subject,
        ))
    }
}

impl<P: CryptoProvider + ?Sized, F: Fetcher + ?Sized> RevocationResolver for CrlResolver<'_, P, F> {
    fn resolve(
        &self,
        subject: &Certificate,
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> Option<RevocationStatus> {
        let mut failures = Vec::new();

        for der in self.embedded {
            match self.check(der, subject, issuer, at) {
                Ok(status) => return Some(status),
                Err(RevocationArtifactError::NotApplicable) => {}
                Err(RevocationArtifactError::Malformed(reason)) => {
                    log::warn!(
                        "Unable to parse signed data revocation info item since it is \
                         incorrect or unsupported ({reason})."
                    );
                }
                Err(err) => failures.push(format!("embedded CRL: {err}")),
            }
        }

        let mut consulted = !failures.is_empty();
        if self.allow_fetch {
            for uri in subject.crl_uris() {
                consulted = true;
                let der = match self.fetcher.fetch(uri) {
                    Ok(der) => der,
                    Err(err) => {
                        failures.push(format!("CRL {uri}: {err}"));
                        continue;
                    }
                };
                match self.check(&der, subject, issuer, at) {
                    Ok(status) => return Some(status),
                    Err(err) => failures.push(format!("CRL {uri}: {err}")),
                }
            }
        }

        consulted.then(|| RevocationStatus::unknown(StatusSource::Crl, failures.join("; ")))
    }
}

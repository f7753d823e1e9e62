use chrono::{DateTime, Utc};

use super::{
    window_contains, RevocationArtifactError, RevocationResolver, RevocationStatus, StatusSource,
};
use crate::certificate::Certificate;
use crate::evidence::{EvidenceKind, RevocationEvidence};
use crate::fetch::{ocsp_get_uri, Fetcher, Guarded};
use crate::provider::{CryptoProvider, OcspCertStatus};

/// Revocation status from OCSP responses.
///
/// Responses embedded with the signature are tried first. Then, if
/// fetching is allowed, each OCSP responder named in the subject's
/// Authority Information Access extension is asked, using the GET binding.
pub struct OcspResolver<'a, P: ?Sized, F: ?Sized> {
    provider: &'a P,
    fetcher: Guarded<'a, F>,
    allow_fetch: bool,
    embedded: &'a [Vec<u8>],
}

impl<'a, P: CryptoProvider + ?Sized, F: Fetcher + ?Sized> OcspResolver<'a, P, F> {
    pub(crate) fn new(
        provider: &'a P,
        fetcher: Guarded<'a, F>,
        allow_fetch: bool,
        embedded: &'a [Vec<u8>],
    ) -> Self {
        OcspResolver {
            provider,
            fetcher,
            allow_fetch,
            embedded,
        }
    }

    fn check(
        &self,
        der: &[u8],
        subject: &Certificate,
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<RevocationStatus, RevocationArtifactError> {
        let response = self.provider.decode_ocsp(der, subject, issuer, at)?;
        if !window_contains(response.this_update, response.next_update, at) {
            return Err(RevocationArtifactError::NotCurrent(format!(
                "OCSP response produced for {} does not cover {at}",
                response.this_update
            )));
        }

        let revoked_at = match response.cert_status {
            OcspCertStatus::Good => None,
            OcspCertStatus::Revoked { revoked_at } => Some(revoked_at),
            OcspCertStatus::Unknown => {
                return Err(RevocationArtifactError::Unsuccessful(
                    "certStatus unknown".to_string(),
                ))
            }
        };

        let evidence = RevocationEvidence::new(
            EvidenceKind::Ocsp,
            der,
            subject.id(),
            response.this_update,
            response.next_update,
        );
        Ok(RevocationStatus::from_artifact(
            StatusSource::Ocsp,
            revoked_at,
            at,
            evidence,
            subject,
        ))
    }
}

impl<P: CryptoProvider + ?Sized, F: Fetcher + ?Sized> RevocationResolver
    for OcspResolver<'_, P, F>
{
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
                Err(err) => failures.push(format!("embedded OCSP response: {err}")),
            }
        }

        let mut consulted = !failures.is_empty();
        if self.allow_fetch && !subject.ocsp_uris().is_empty() {
            consulted = true;
            match self.provider.ocsp_request(subject, issuer) {
                Ok(request) => {
                    for responder in subject.ocsp_uris() {
                        let uri = ocsp_get_uri(responder, &request);
                        let der = match self.fetcher.fetch(&uri) {
                            Ok(der) => der,
                            Err(err) => {
                                failures.push(format!("OCSP {responder}: {err}"));
                                continue;
                            }
                        };
                        match self.check(&der, subject, issuer, at) {
                            Ok(status) => return Some(status),
                            Err(err) => failures.push(format!("OCSP {responder}: {err}")),
                        }
                    }
                }
                Err(err) => failures.push(format!("OCSP request: {err}")),
            }
        }

        consulted.then(|| RevocationStatus::unknown(StatusSource::Ocsp, failures.join("; ")))
    }
}

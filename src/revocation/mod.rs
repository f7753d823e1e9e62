//! Revocation status of a certificate at a given date.
//!
//! Two independent resolvers, [`crl::CrlResolver`] and
//! [`ocsp::OcspResolver`], each try to establish the status of a certificate.
//! Their answers are combined by [`RevocationEvaluator`], worst case first.
//! A resolver failure never escalates to anything stronger than
//! [`RevocationState::Unknown`].

pub mod crl;
pub mod ocsp;

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::certificate::Certificate;
use crate::evidence::RevocationEvidence;

pub use crl::CrlResolver;
pub use ocsp::OcspResolver;

/// Malformed or unverifiable CRL/OCSP payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevocationArtifactError {
    #[error("malformed revocation artifact: {0}")]
    Malformed(String),
    #[error("revocation artifact signature does not verify: {0}")]
    BadSignature(String),
    #[error("artifact does not cover this certificate")]
    NotApplicable,
    #[error("artifact is not current at the verification date: {0}")]
    NotCurrent(String),
    #[error("OCSP responder answered {0}")]
    Unsuccessful(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationState {
    Valid,
    Revoked { revoked_at: DateTime<Utc> },
    Unknown,
}

impl RevocationState {
    /// Ordering for the worst-case combination: Revoked > Unknown > Valid.
    fn severity(&self) -> u8 {
        match self {
            RevocationState::Valid => 0,
            RevocationState::Unknown => 1,
            RevocationState::Revoked { .. } => 2,
        }
    }
}

/// Reasons for not checking revocation of a certificate at all.
///
/// New kinds can be added here without touching the resolvers: the
/// [`ExemptionPolicy`] decides, the evaluator skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exemption {
    /// The certificate carries the "validity assured - short term"
    /// extension: its issuer does not publish revocation data for it.
    ValidityAssuredShortTerm,
    /// The certificate is trusted as such.
    TrustAnchor,
}

impl fmt::Display for Exemption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exemption::ValidityAssuredShortTerm => f.write_str("validity assured - short term"),
            Exemption::TrustAnchor => f.write_str("trust anchor"),
        }
    }
}

/// Decides which certificates are exempt from revocation checking.
pub trait ExemptionPolicy: Send + Sync {
    fn exemption(&self, cert: &Certificate) -> Option<Exemption>;
}

/// Exempts certificates marked "validity assured - short term".
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExemptions;

impl ExemptionPolicy for DefaultExemptions {
    fn exemption(&self, cert: &Certificate) -> Option<Exemption> {
        cert.is_validity_assured()
            .then_some(Exemption::ValidityAssuredShortTerm)
    }
}

/// Who asserted a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    Crl,
    Ocsp,
    Policy(Exemption),
    /// Nothing could be consulted.
    Unavailable,
}

/// A revocation status with its provenance.
#[derive(Debug, Clone)]
pub struct RevocationStatus {
    pub state: RevocationState,
    pub source: StatusSource,
    /// When the source asserted the status (thisUpdate of the artifact).
    pub asserted_at: Option<DateTime<Utc>>,
    pub evidence: Option<RevocationEvidence>,
    pub detail: String,
}

impl RevocationStatus {
    pub fn valid_by_policy(exemption: Exemption) -> Self {
        RevocationStatus {
            state: RevocationState::Valid,
            source: StatusSource::Policy(exemption),
            asserted_at: None,
            evidence: None,
            detail: format!("revocation check skipped: {exemption}"),
        }
    }

    pub fn unknown(source: StatusSource, detail: impl Into<String>) -> Self {
        RevocationStatus {
            state: RevocationState::Unknown,
            source,
            asserted_at: None,
            evidence: None,
            detail: detail.into(),
        }
    }

    /// A status backed by a verified artifact, as seen at `at`.
    ///
    /// A revocation after `at` does not count: the certificate was still
    /// good on the verification date.
    pub(crate) fn from_artifact(
        source: StatusSource,
        revoked_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
        evidence: RevocationEvidence,
        subject: &Certificate,
    ) -> Self {
        let asserted_at = Some(evidence.this_update);
        let (state, detail) = match revoked_at {
            Some(revoked_at) if revoked_at <= at => (
                RevocationState::Revoked { revoked_at },
                format!("revoked at {revoked_at}"),
            ),
            Some(revoked_at) => {
                log::warn!(
                    "{}: The certificate was valid on the verification date, but has been \
                     revoked since {revoked_at}.",
                    subject.subject()
                );
                (
                    RevocationState::Valid,
                    format!("valid at {at}, revoked since {revoked_at}"),
                )
            }
            None => (RevocationState::Valid, "not revoked".to_string()),
        };

        RevocationStatus {
            state,
            source,
            asserted_at,
            evidence: Some(evidence),
            detail,
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self.state, RevocationState::Revoked { .. })
    }

    pub fn is_unknown(&self) -> bool {
        self.state == RevocationState::Unknown
    }
}

/// Worst-case combination of the statuses reported for one certificate.
///
/// Equal severities keep the first status. No status at all means nothing
/// could be consulted, which is Unknown.
pub fn combine(statuses: impl IntoIterator<Item = RevocationStatus>) -> RevocationStatus {
    statuses
        .into_iter()
        .reduce(|worst, next| {
            if next.state.severity() > worst.state.severity() {
                next
            } else {
                worst
            }
        })
        .unwrap_or_else(|| {
            RevocationStatus::unknown(StatusSource::Unavailable, "no revocation source available")
        })
}

/// The common contract of CRL and OCSP resolution.
pub trait RevocationResolver {
    /// Status of `subject` at `at`, or `None` when this resolver has nothing
    /// to consult for it (no embedded artifact, no location hint).
    fn resolve(
        &self,
        subject: &Certificate,
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> Option<RevocationStatus>;
}

/// Runs the enabled resolvers for a certificate, after giving the exemption
/// policy a chance to skip it.
pub struct RevocationEvaluator<'a> {
    pub(crate) resolvers: Vec<&'a (dyn RevocationResolver + Sync)>,
    pub(crate) exemptions: &'a dyn ExemptionPolicy,
}

impl<'a> RevocationEvaluator<'a> {
    pub fn new(exemptions: &'a dyn ExemptionPolicy) -> Self {
        RevocationEvaluator {
            resolvers: Vec::new(),
            exemptions,
        }
    }

    pub fn with_resolver(mut self, resolver: &'a (dyn RevocationResolver + Sync)) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn exemption(&self, cert: &Certificate) -> Option<Exemption> {
        self.exemptions.exemption(cert)
    }

    pub fn evaluate(
        &self,
        subject: &Certificate,
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> RevocationStatus {
        self.evaluate_collecting(subject, issuer, at).0
    }

    /// Like [`Self::evaluate`], but also returns the evidence behind every
    /// resolver answer, not only behind the one that decided.
    pub fn evaluate_collecting(
        &self,
        subject: &Certificate,
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> (RevocationStatus, Vec<RevocationEvidence>) {
        if let Some(exemption) = self.exemption(subject) {
            log::debug!("{}: revocation check skipped ({exemption})", subject.subject());
            return (RevocationStatus::valid_by_policy(exemption), Vec::new());
        }

        let statuses: Vec<RevocationStatus> = self
            .resolvers
            .iter()
            .filter_map(|resolver| resolver.resolve(subject, issuer, at))
            .collect();
        let evidence = statuses
            .iter()
            .filter_map(|status| status.evidence.clone())
            .collect();

        let status = combine(statuses);
        log::debug!(
            "{}: revocation {:?} ({})",
            subject.subject(),
            status.state,
            status.detail
        );
        (status, evidence)
    }
}

/// Whether `at` falls inside [this_update, next_update]. A missing
/// next_update leaves the window open.
pub(crate) fn window_contains(
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
) -> bool {
    this_update <= at && next_update.map_or(true, |next| at <= next)
}

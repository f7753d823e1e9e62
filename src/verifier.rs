//! Signature and trust verification.
//!
//! A [`ValidationSession`] takes one signature through
//! `Init → SignatureChecked → ChainBuilt → RevocationEvaluated → Verdicted`.
//! A malformed signature container aborts the run instead. Everything short
//! of that ends in a [`ValidationVerdict`], whose diagnostics record why the
//! verdict is what it is.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::certificate::{CertId, Certificate};
use crate::chain::{ChainBuilder, ChainError, CertificateChain};
use crate::config::{TimeFallback, ValidationConfig};
use crate::evidence::{EvidenceStore, RevocationEvidence};
use crate::fetch::{CancellationToken, Fetcher, Guarded};
use crate::provider::CryptoProvider;
use crate::revocation::{
    CrlResolver, DefaultExemptions, Exemption, ExemptionPolicy, OcspResolver, RevocationEvaluator,
    RevocationState, RevocationStatus,
};
use crate::signature::{EmbeddedRevocationData, IntegrityResult, SignatureRecord};
use crate::store::CertificateStore;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictStatus {
    Valid,
    /// Not enough evidence either way.
    Indeterminate,
    Invalid,
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictStatus::Valid => f.write_str("VALID"),
            VerdictStatus::Indeterminate => f.write_str("INDETERMINATE"),
            VerdictStatus::Invalid => f.write_str("INVALID"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Init,
    SignatureChecked,
    ChainBuilt,
    RevocationEvaluated,
    Verdicted,
    Aborted,
}

/// Where the verification date came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    /// A trusted timestamp token.
    Timestamp,
    /// The signing time the signer wrote down.
    Claimed,
    /// The date given by the caller.
    CallerSupplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationTime {
    pub at: DateTime<Utc>,
    pub source: TimeSource,
}

/// Revocation and validity of one chain certificate at the verification
/// date.
#[derive(Debug, Clone)]
pub struct CertificateStatus {
    pub id: CertId,
    pub subject: String,
    pub status: RevocationStatus,
    /// Whether the verification date is inside [notBefore, notAfter].
    pub within_validity: bool,
}

/// A note taken along the way, tagged with the state it was taken in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub state: ValidationState,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum ChainOutcome {
    /// The run ended before chain building.
    NotAttempted,
    Built(CertificateChain),
    Failed(ChainError),
}

#[derive(Debug, Clone)]
pub struct ValidationVerdict {
    pub status: VerdictStatus,
    /// Human readable explanation of `status`.
    pub reason: String,
    pub integrity: IntegrityResult,
    pub chain: ChainOutcome,
    /// Chain order, leaf first. Empty if revocation was never evaluated.
    pub certificates: Vec<CertificateStatus>,
    pub verification_time: Option<VerificationTime>,
    /// True only when the verification time comes from a trusted
    /// timestamp. A claimed signing time is the signer's own statement, and
    /// a caller supplied date may differ when the run is replayed.
    pub time_verified: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationVerdict {
    fn new(integrity: IntegrityResult) -> Self {
        ValidationVerdict {
            status: VerdictStatus::Indeterminate,
            reason: String::new(),
            integrity,
            chain: ChainOutcome::NotAttempted,
            certificates: Vec::new(),
            verification_time: None,
            time_verified: false,
            diagnostics: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == VerdictStatus::Valid
    }

    /// The chain, if one was built.
    pub fn chain(&self) -> Option<&CertificateChain> {
        match &self.chain {
            ChainOutcome::Built(chain) => Some(chain),
            _ => None,
        }
    }
}

/// State bookkeeping of a single run.
struct Run {
    signer: String,
    state: ValidationState,
    diagnostics: Vec<Diagnostic>,
}

impl Run {
    fn new(signer: &Certificate) -> Self {
        Run {
            signer: signer.subject().to_string(),
            state: ValidationState::Init,
            diagnostics: Vec::new(),
        }
    }

    fn advance(&mut self, next: ValidationState) {
        log::debug!("{}: {:?} -> {:?}", self.signer, self.state, next);
        self.state = next;
    }

    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::debug!("{}: {message}", self.signer);
        self.diagnostics.push(Diagnostic {
            state: self.state,
            message,
        });
    }

    fn conclude(
        mut self,
        mut verdict: ValidationVerdict,
        status: VerdictStatus,
        reason: String,
    ) -> ValidationVerdict {
        self.advance(ValidationState::Verdicted);
        log::info!("{}: {status} ({reason})", self.signer);
        verdict.status = status;
        verdict.reason = reason;
        verdict.diagnostics = self.diagnostics;
        verdict
    }
}

/// Validates signatures against trust anchors, sharing what it learns
/// (certificates, revocation evidence) across runs.
///
/// A session is `Sync`: several signatures can be validated at once, see
/// [`Self::validate_all`].
pub struct ValidationSession<P, F> {
    provider: P,
    fetcher: F,
    config: ValidationConfig,
    store: CertificateStore,
    evidence: EvidenceStore,
    exemptions: Box<dyn ExemptionPolicy>,
    cancel: CancellationToken,
}

impl<P: CryptoProvider, F: Fetcher> ValidationSession<P, F> {
    pub fn new(provider: P, fetcher: F, config: ValidationConfig) -> Self {
        ValidationSession {
            provider,
            fetcher,
            config,
            store: CertificateStore::new(),
            evidence: EvidenceStore::new(),
            exemptions: Box::new(DefaultExemptions),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to stop the session's runs from the outside.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_exemptions(mut self, policy: impl ExemptionPolicy + 'static) -> Self {
        self.exemptions = Box::new(policy);
        self
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Validates one signature as of the verification date.
    ///
    /// `date` is used only when the signature carries no usable time of its
    /// own, see [`ValidationConfig::time_fallback`].
    ///
    /// Errors are reserved for a malformed signature container, a missing
    /// trust anchor set and cancellation. Every other problem yields a
    /// verdict.
    pub fn validate(
        &self,
        record: &SignatureRecord<'_>,
        trust_anchors: &[Certificate],
        date: DateTime<Utc>,
    ) -> Result<ValidationVerdict, Error> {
        if trust_anchors.is_empty() {
            return Err(Error::NoTrustAnchors);
        }
        let mut run = Run::new(&record.signer);

        if let Err(err) = record.check_structure() {
            run.advance(ValidationState::Aborted);
            log::warn!("{}: {err}", run.signer);
            return Err(err.into());
        }
        self.checkpoint(&mut run)?;

        let integrity = self.provider.verify_signature(record);
        let mut verdict = ValidationVerdict::new(integrity.clone());
        if !integrity.intact {
            run.note(format!("integrity check failed: {}", integrity.reason));
            let reason = format!("signature integrity failure: {}", integrity.reason);
            return Ok(run.conclude(verdict, VerdictStatus::Invalid, reason));
        }
        run.advance(ValidationState::SignatureChecked);

        let Some(time) = self.verification_time(record, date, &mut run) else {
            let reason = "no trusted or claimed signing time to validate at".to_string();
            return Ok(run.conclude(verdict, VerdictStatus::Indeterminate, reason));
        };
        verdict.verification_time = Some(time);
        verdict.time_verified = time.source == TimeSource::Timestamp;

        self.checkpoint(&mut run)?;
        for anchor in trust_anchors {
            self.store.add(anchor.clone());
        }
        for cert in &record.certificates {
            self.store.add(cert.clone());
        }
        let link_check = |subject: &Certificate, issuer: &Certificate| {
            self.provider.verify_issued_by(subject, issuer)
        };
        let builder = ChainBuilder::new(&self.store, &self.fetcher, &self.config, &self.cancel)
            .with_link_check(&link_check);
        let chain = match builder.build(&record.signer, trust_anchors) {
            Ok(chain) => chain,
            Err(err) => {
                self.checkpoint(&mut run)?;
                run.note(err.to_string());
                let reason = chain_reason(&err);
                verdict.chain = ChainOutcome::Failed(err);
                return Ok(run.conclude(verdict, VerdictStatus::Indeterminate, reason));
            }
        };
        verdict.chain = ChainOutcome::Built(chain.clone());
        run.advance(ValidationState::ChainBuilt);

        if let Some(reason) = self.check_chain(&chain, trust_anchors, &mut run) {
            return Ok(run.conclude(verdict, VerdictStatus::Indeterminate, reason));
        }

        self.checkpoint(&mut run)?;
        let found = EvidenceStore::new();
        let indices = (0..chain.len()).collect();
        let statuses = self.evaluate(&chain, &record.embedded_revocation, indices, time.at, &found);
        // A cancelled run must not leave partial evidence behind.
        self.checkpoint(&mut run)?;
        self.evidence.absorb(found);

        for status in &statuses {
            if status.status.is_unknown() {
                run.note(format!(
                    "{}: revocation status unknown ({})",
                    status.subject, status.status.detail
                ));
            }
        }
        run.advance(ValidationState::RevocationEvaluated);

        let (mut status, mut reason) = reduce(&statuses, time.at);
        verdict.certificates = statuses;
        if status == VerdictStatus::Valid
            && self.config.require_trusted_timestamp
            && time.source != TimeSource::Timestamp
        {
            run.note("a trusted timestamp is required");
            status = VerdictStatus::Indeterminate;
            reason = "signature carries no trusted timestamp".to_string();
        }
        Ok(run.conclude(verdict, status, reason))
    }

    /// Validates several signatures in parallel, one verdict per record in
    /// the same order.
    pub fn validate_all(
        &self,
        records: &[SignatureRecord<'_>],
        trust_anchors: &[Certificate],
        date: DateTime<Utc>,
    ) -> Vec<Result<ValidationVerdict, Error>> {
        map_indices((0..records.len()).collect(), |i| {
            self.validate(&records[i], trust_anchors, date)
        })
    }

    /// Revocation evidence to embed for `chain`, in chain order.
    ///
    /// Certificates with no evidence yet are resolved first, best effort:
    /// a failure only means less evidence. Trust anchors and exempt
    /// certificates get none.
    pub fn collect_ltv_evidence(
        &self,
        chain: &CertificateChain,
        date: DateTime<Utc>,
    ) -> Result<Vec<RevocationEvidence>, Error> {
        let mut missing = Vec::new();
        for (index, cert) in chain.certificates().iter().enumerate() {
            if chain.is_anchored() && index + 1 == chain.len() {
                continue;
            }
            match self.exemptions.exemption(cert) {
                Some(Exemption::ValidityAssuredShortTerm) => {
                    log::info!(
                        "Revocation data for certificate: \"{}\" is not added due to \
                         validity assured - short term extension.",
                        cert.subject()
                    );
                    continue;
                }
                Some(exemption) => {
                    log::debug!("{}: no revocation data needed ({exemption})", cert.subject());
                    continue;
                }
                None => {}
            }
            if !self.evidence.has_evidence(&cert.id()) {
                missing.push(index);
            }
        }

        if !missing.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let found = EvidenceStore::new();
            let statuses = self.evaluate(
                chain,
                &EmbeddedRevocationData::default(),
                missing,
                date,
                &found,
            );
            for status in statuses.iter().filter(|s| s.status.evidence.is_none()) {
                log::warn!(
                    "{}: no revocation evidence could be collected ({})",
                    status.subject,
                    status.status.detail
                );
            }
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.evidence.absorb(found);
        }

        Ok(self.evidence.export_for(chain))
    }

    fn checkpoint(&self, run: &mut Run) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            run.note("cancelled");
            run.advance(ValidationState::Aborted);
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Timestamp, then claimed time, then the configured fallback.
    fn verification_time(
        &self,
        record: &SignatureRecord<'_>,
        date: DateTime<Utc>,
        run: &mut Run,
    ) -> Option<VerificationTime> {
        if let Some(at) = record.timestamp_time {
            return Some(VerificationTime {
                at,
                source: TimeSource::Timestamp,
            });
        }
        if self.config.use_claimed_time {
            if let Some(at) = record.claimed_signing_time {
                run.note(format!("validating at the claimed signing time {at}"));
                return Some(VerificationTime {
                    at,
                    source: TimeSource::Claimed,
                });
            }
        }
        match self.config.time_fallback {
            TimeFallback::CallerSupplied => {
                run.note(format!("time-unverified: validating at caller supplied {date}"));
                Some(VerificationTime {
                    at: date,
                    source: TimeSource::CallerSupplied,
                })
            }
            TimeFallback::Reject => {
                run.note("no signing time available and fallback is disabled");
                None
            }
        }
    }

    /// Checks what the chain builder leaves out: the signature of every
    /// link, and that the chain ends at one of the given anchors.
    fn check_chain(
        &self,
        chain: &CertificateChain,
        trust_anchors: &[Certificate],
        run: &mut Run,
    ) -> Option<String> {
        for (subject, issuer) in chain.links() {
            if !self.provider.verify_issued_by(subject, issuer) {
                let reason = format!(
                    "signature of {} does not verify with the key of {}",
                    subject.subject(),
                    issuer.subject()
                );
                run.note(reason.clone());
                return Some(reason);
            }
        }

        let Some(anchor) = chain.anchor() else {
            let last = chain.certificates().last().map(|c| c.subject().to_string());
            let reason = format!(
                "chain ends at untrusted root {}",
                last.unwrap_or_default()
            );
            run.note(reason.clone());
            return Some(reason);
        };
        if !trust_anchors.iter().any(|t| t.id() == anchor.id()) {
            let reason = format!(
                "chain ends at a certificate named like trust anchor {} but not equal to it",
                anchor.subject()
            );
            run.note(reason.clone());
            return Some(reason);
        }
        None
    }

    fn guarded(&self) -> Guarded<'_, F> {
        Guarded {
            fetcher: &self.fetcher,
            cancel: &self.cancel,
            timeout: self.config.fetch_timeout,
        }
    }

    /// Revocation status of the chain certificates at `indices`, evaluated
    /// in parallel. Evidence backing the statuses goes to `sink`.
    fn evaluate(
        &self,
        chain: &CertificateChain,
        embedded: &EmbeddedRevocationData,
        indices: Vec<usize>,
        at: DateTime<Utc>,
        sink: &EvidenceStore,
    ) -> Vec<CertificateStatus> {
        let allow_fetch = self.config.allow_fetch;
        let crl = CrlResolver::new(&self.provider, self.guarded(), allow_fetch, &embedded.crls);
        let ocsp = OcspResolver::new(
            &self.provider,
            self.guarded(),
            allow_fetch,
            &embedded.ocsp_responses,
        );

        let mut evaluator = RevocationEvaluator::new(&*self.exemptions);
        if self.config.allow_crl {
            evaluator = evaluator.with_resolver(&crl);
        }
        if self.config.allow_ocsp {
            evaluator = evaluator.with_resolver(&ocsp);
        }

        map_indices(indices, |index| {
            let cert = &chain.certificates()[index];
            let (status, evidence) = if chain.is_anchored() && index + 1 == chain.len() {
                let status = RevocationStatus::valid_by_policy(Exemption::TrustAnchor);
                (status, Vec::new())
            } else {
                let issuer = chain.issuer_of(index).unwrap_or(cert);
                evaluator.evaluate_collecting(cert, issuer, at)
            };
            for item in evidence {
                sink.record(cert.id(), item);
            }
            CertificateStatus {
                id: cert.id(),
                subject: cert.subject().to_string(),
                within_validity: cert.is_valid_at(at),
                status,
            }
        })
    }
}

fn map_indices<T: Send>(indices: Vec<usize>, f: impl Fn(usize) -> T + Sync + Send) -> Vec<T> {
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        indices.into_par_iter().map(f).collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        indices.into_iter().map(f).collect()
    }
}

fn chain_reason(err: &ChainError) -> String {
    match err {
        ChainError::Incomplete { .. } => format!("chain incomplete: {err}"),
        ChainError::Cycle { .. } => format!("certificate cycle: {err}"),
        ChainError::TooDeep { .. } => format!("chain too deep: {err}"),
    }
}

/// Reduces per-certificate statuses to a verdict.
///
/// A revocation at or before `at` makes the signature invalid. Otherwise
/// any unknown status, or a certificate used outside its validity period,
/// makes it indeterminate. The result does not depend on the order of
/// `certificates`.
pub fn reduce(certificates: &[CertificateStatus], at: DateTime<Utc>) -> (VerdictStatus, String) {
    let revoked = certificates
        .iter()
        .filter_map(|c| match c.status.state {
            RevocationState::Revoked { revoked_at } if revoked_at <= at => {
                Some((revoked_at, &c.subject))
            }
            _ => None,
        })
        .min();
    if let Some((revoked_at, subject)) = revoked {
        return (
            VerdictStatus::Invalid,
            format!("certificate {subject} was revoked at {revoked_at}"),
        );
    }

    let unknown = certificates
        .iter()
        .filter(|c| c.status.is_unknown())
        .min_by(|a, b| (&a.subject, &a.status.detail).cmp(&(&b.subject, &b.status.detail)));
    if let Some(c) = unknown {
        return (
            VerdictStatus::Indeterminate,
            format!(
                "revocation status unknown for {}: {}",
                c.subject, c.status.detail
            ),
        );
    }

    let expired = certificates
        .iter()
        .filter(|c| !c.within_validity)
        .map(|c| &c.subject)
        .min();
    if let Some(subject) = expired {
        return (
            VerdictStatus::Indeterminate,
            format!("certificate {subject} is not within its validity period at {at}"),
        );
    }

    (
        VerdictStatus::Valid,
        format!("signature and certificate chain are valid at {at}"),
    )
}

/// Shorthand for a one-off validation with a fresh session.
pub fn validate<P: CryptoProvider, F: Fetcher>(
    provider: P,
    fetcher: F,
    config: ValidationConfig,
    record: &SignatureRecord<'_>,
    trust_anchors: &[Certificate],
    date: DateTime<Utc>,
) -> Result<ValidationVerdict, Error> {
    ValidationSession::new(provider, fetcher, config).validate(record, trust_anchors, date)
}


#[cfg(all(test, feature = "openssl"))]
mod scenarios {
    use super::*;
    use crate::fetch::{ocsp_get_uri, FetchError};
    use crate::provider::{DecodedCrl, DecodedOcsp, OcspCertStatus, RevokedEntry};
    use crate::revocation::StatusSource;
    use crate::signature::StructuralError;
    use crate::testutil::{day, CertSpec, FakeFetcher, FakeProvider, Issued, Pki};
    use std::time::Duration;

    const DOC: &[u8] = b"%PDF-1.7 signed content";
    const OCSP_URI: &str = "http://ocsp.example";

    struct Pkix {
        root: Issued,
        inter: Issued,
        leaf: Issued,
    }

    fn pkix(leaf: CertSpec) -> Pkix {
        let mut pki = Pki::new();
        let root = pki.root("Root CA");
        let inter = pki.issue(
            &root,
            CertSpec::ca("Intermediate").ca_issuers("http://ca.example/root.cer"),
        );
        let leaf = pki.issue(&inter, leaf);
        Pkix { root, inter, leaf }
    }

    fn signer() -> CertSpec {
        CertSpec::leaf("Signer")
            .ocsp(OCSP_URI)
            .ca_issuers("http://ca.example/inter.cer")
    }

    fn crl(issuer: &Issued, revoked: Vec<RevokedEntry>) -> DecodedCrl {
        DecodedCrl {
            issuer: issuer.cert().subject().as_der().to_vec(),
            this_update: day(1),
            next_update: Some(day(20)),
            revoked,
        }
    }

    fn ocsp(cert_status: OcspCertStatus) -> DecodedOcsp {
        DecodedOcsp {
            cert_status,
            this_update: day(1),
            next_update: Some(day(20)),
        }
    }

    fn revoked(cert: &Issued, at: DateTime<Utc>) -> Vec<RevokedEntry> {
        vec![RevokedEntry {
            serial: cert.cert().serial().to_vec(),
            revoked_at: at,
        }]
    }

    /// A provider knowing an empty CRL of the root, a CRL of the
    /// intermediate listing `leaf_revocations`, and a good OCSP response for
    /// the leaf.
    fn fake_provider(p: &Pkix, leaf_revocations: Vec<RevokedEntry>) -> FakeProvider {
        FakeProvider::new()
            .crl(b"root crl", crl(&p.root, vec![]))
            .crl(b"inter crl", crl(&p.inter, leaf_revocations))
            .ocsp(b"leaf ocsp", &p.leaf.cert(), ocsp(OcspCertStatus::Good))
    }

    fn ocsp_fetcher(p: &Pkix, provider: &FakeProvider) -> FakeFetcher {
        let uri = ocsp_get_uri(OCSP_URI, &provider.request_for(&p.leaf.cert()));
        FakeFetcher::new().respond(&uri, Ok(b"leaf ocsp".to_vec()))
    }

    fn record<'a>(p: &Pkix, embedded_crls: &[&[u8]]) -> SignatureRecord<'a> {
        SignatureRecord::new(DOC, vec![0..9, 12..DOC.len()], vec![0x30], p.leaf.cert())
            .with_certificates(vec![p.inter.cert()])
            .with_embedded_revocation(EmbeddedRevocationData {
                crls: embedded_crls.iter().map(|c| c.to_vec()).collect(),
                ocsp_responses: Vec::new(),
            })
    }

    fn new_session(
        provider: FakeProvider,
        fetcher: FakeFetcher,
    ) -> ValidationSession<FakeProvider, FakeFetcher> {
        ValidationSession::new(provider, fetcher, ValidationConfig::default())
    }

    #[test]
    fn test_valid_chain() {
        let p = pkix(signer());
        let provider = fake_provider(&p, vec![]);
        let fetcher = ocsp_fetcher(&p, &provider);
        let session = new_session(provider, fetcher);

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Valid, "{}", verdict.reason);
        assert!(verdict.integrity.intact);
        assert_eq!(
            verdict.chain().unwrap().subjects(),
            ["CN=Signer", "CN=Intermediate", "CN=Root CA"]
        );
        assert_eq!(verdict.certificates.len(), 3);
        assert_eq!(
            verdict.certificates[2].status.source,
            StatusSource::Policy(Exemption::TrustAnchor)
        );
        assert_eq!(
            verdict.verification_time,
            Some(VerificationTime {
                at: day(10),
                source: TimeSource::CallerSupplied
            })
        );
        assert!(!verdict.time_verified);

        // The leaf is covered by its issuer's CRL and by the OCSP response.
        assert_eq!(session.evidence().get(&p.leaf.cert().id()).len(), 2);
        assert_eq!(session.evidence().get(&p.inter.cert().id()).len(), 1);
    }

    #[test]
    fn test_valid_with_ocsp_only() {
        let p = pkix(signer());
        let provider = fake_provider(&p, vec![]);
        let fetcher = ocsp_fetcher(&p, &provider);
        let session = new_session(provider, fetcher);

        let verdict = session
            .validate(&record(&p, &[b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Valid, "{}", verdict.reason);
        assert_eq!(verdict.certificates[0].status.source, StatusSource::Ocsp);
    }

    #[test]
    fn test_revoked_signer_is_invalid() {
        let p = pkix(signer());
        let provider = fake_provider(&p, revoked(&p.leaf, day(9)));
        let fetcher = ocsp_fetcher(&p, &provider);
        let session = new_session(provider, fetcher);

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Invalid);
        assert_eq!(
            verdict.reason,
            format!("certificate CN=Signer was revoked at {}", day(9))
        );
        assert!(verdict.certificates[0].status.is_revoked());
    }

    #[test]
    fn test_revocation_after_verification_date() {
        let p = pkix(signer());
        let provider = fake_provider(&p, revoked(&p.leaf, day(12)));
        let fetcher = ocsp_fetcher(&p, &provider);
        let session = new_session(provider, fetcher);

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Valid, "{}", verdict.reason);
        assert_eq!(verdict.certificates[0].status.state, RevocationState::Valid);

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(13))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Invalid);
    }

    #[test]
    fn test_aia_timeout_is_indeterminate() {
        let p = pkix(signer());
        let fetcher = FakeFetcher::new().respond(
            "http://ca.example/inter.cer",
            Err(FetchError::Timeout(
                Duration::from_secs(10),
                "http://ca.example/inter.cer".into(),
            )),
        );
        let session = new_session(fake_provider(&p, vec![]), fetcher);

        let record = record(&p, &[]).with_certificates(vec![]);
        let verdict = session.validate(&record, &[p.root.cert()], day(10)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert_eq!(
            verdict.reason,
            "chain incomplete: issuer unobtainable for CN=Intermediate"
        );
        assert!(matches!(
            verdict.chain,
            ChainOutcome::Failed(ChainError::Incomplete { .. })
        ));
        assert!(verdict.certificates.is_empty());
    }

    #[test]
    fn test_unknown_revocation_is_indeterminate() {
        let p = pkix(signer());
        // No CRL for the leaf and the OCSP responder is down.
        let session = new_session(fake_provider(&p, vec![]), FakeFetcher::new());

        let verdict = session
            .validate(&record(&p, &[b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert!(verdict
            .reason
            .starts_with("revocation status unknown for CN=Signer"));
        assert!(verdict.certificates[0].status.is_unknown());
        assert!(verdict
            .diagnostics
            .iter()
            .any(|d| d.state == ValidationState::ChainBuilt && d.message.contains("CN=Signer")));
    }

    #[test]
    fn test_validity_assured_skips_revocation() {
        let p = pkix(signer().validity_assured());
        // The OCSP responder is unreachable, which does not matter.
        let session = new_session(fake_provider(&p, vec![]), FakeFetcher::new());

        let verdict = session
            .validate(&record(&p, &[b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Valid, "{}", verdict.reason);
        assert_eq!(
            verdict.certificates[0].status.source,
            StatusSource::Policy(Exemption::ValidityAssuredShortTerm)
        );
        assert!(session.fetcher.calls().is_empty());
    }

    #[test]
    fn test_revocation_disabled_is_indeterminate() {
        let p = pkix(signer());
        let provider = fake_provider(&p, vec![]);
        let fetcher = ocsp_fetcher(&p, &provider);
        let config = ValidationConfig::default().with_crl(false).with_ocsp(false);
        let session = ValidationSession::new(provider, fetcher, config);

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert_eq!(
            verdict.certificates[0].status.source,
            StatusSource::Unavailable
        );
    }

    #[test]
    fn test_integrity_failure_skips_the_rest() {
        let p = pkix(signer());
        let session = new_session(fake_provider(&p, vec![]).tampered(), FakeFetcher::new());

        let verdict = session
            .validate(&record(&p, &[]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Invalid);
        assert!(verdict.reason.starts_with("signature integrity failure"));
        assert!(matches!(verdict.chain, ChainOutcome::NotAttempted));
        assert!(session.store().is_empty());
    }

    #[test]
    fn test_malformed_ranges_abort() {
        let p = pkix(signer());
        let session = new_session(fake_provider(&p, vec![]), FakeFetcher::new());

        let mut record = record(&p, &[]);
        record.byte_ranges = vec![0..5, 3..9];
        let err = session
            .validate(&record, &[p.root.cert()], day(10))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Structural(StructuralError::Overlapping)
        ));
    }

    #[test]
    fn test_no_trust_anchors() {
        let p = pkix(signer());
        let session = new_session(fake_provider(&p, vec![]), FakeFetcher::new());
        let err = session.validate(&record(&p, &[]), &[], day(10)).unwrap_err();
        assert!(matches!(err, Error::NoTrustAnchors));
    }

    #[test]
    fn test_cancelled_run_keeps_no_evidence() {
        let p = pkix(signer());
        let provider = fake_provider(&p, vec![]);
        let fetcher = ocsp_fetcher(&p, &provider);
        let token = CancellationToken::new();
        let session = new_session(provider, fetcher).with_cancellation(token.clone());

        token.cancel();
        let err = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(session.evidence().is_empty());
    }

    #[test]
    fn test_untrusted_root() {
        let mut pki = Pki::new();
        let rogue = pki.root("Rogue Root");
        let trusted = pki.root("Trusted Root");
        let leaf = pki.issue(&rogue, CertSpec::leaf("Signer"));
        let session = new_session(FakeProvider::new(), FakeFetcher::new());

        let record = SignatureRecord::new(DOC, vec![0..DOC.len()], vec![0x30], leaf.cert())
            .with_certificates(vec![rogue.cert()]);
        let verdict = session.validate(&record, &[trusted.cert()], day(10)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert_eq!(verdict.reason, "chain ends at untrusted root CN=Rogue Root");
    }

    #[test]
    fn test_impostor_anchor() {
        let mut pki = Pki::new();
        let impostor = pki.root("Root CA");
        let real = pki.root("Root CA");
        let leaf = pki.issue(&impostor, CertSpec::leaf("Signer"));
        let session = new_session(FakeProvider::new(), FakeFetcher::new());

        // The impostor is known to the session before the real anchor.
        session.store().add(impostor.cert());
        let record = SignatureRecord::new(DOC, vec![0..DOC.len()], vec![0x30], leaf.cert());
        let verdict = session.validate(&record, &[real.cert()], day(10)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert!(verdict.reason.contains("not equal to it"));
    }

    #[test]
    fn test_broken_link() {
        let p = pkix(signer());
        let provider = fake_provider(&p, vec![]).broken_link(&p.inter.cert());
        let session = new_session(provider, FakeFetcher::new());

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert_eq!(
            verdict.reason,
            "signature of CN=Intermediate does not verify with the key of CN=Root CA"
        );
    }

    #[test]
    fn test_same_named_intermediates() {
        let mut pki = Pki::new();
        let root = pki.root("Root CA");
        let old = pki.issue(&root, CertSpec::ca("Intermediate").without_key_ids());
        let new = pki.issue(&root, CertSpec::ca("Intermediate").without_key_ids());
        let leaf = pki.issue(
            &new,
            CertSpec::leaf("Signer").validity_assured().without_key_ids(),
        );

        let provider = FakeProvider::new()
            .crl(b"root crl", crl(&root, vec![]))
            .wrong_issuer(&leaf.cert(), &old.cert());
        let session = new_session(provider, FakeFetcher::new());

        let record = SignatureRecord::new(DOC, vec![0..9, 12..DOC.len()], vec![0x30], leaf.cert())
            .with_certificates(vec![old.cert(), new.cert()])
            .with_embedded_revocation(EmbeddedRevocationData {
                crls: vec![b"root crl".to_vec()],
                ocsp_responses: Vec::new(),
            });
        let verdict = session.validate(&record, &[root.cert()], day(10)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Valid, "{}", verdict.reason);
        assert_eq!(
            verdict.chain().unwrap().ids().collect::<Vec<_>>(),
            [leaf.cert().id(), new.cert().id(), root.cert().id()]
        );
    }

    #[test]
    fn test_expired_certificate() {
        let p = pkix(signer().valid(day(1), day(5)));
        let provider = fake_provider(&p, vec![]);
        let fetcher = ocsp_fetcher(&p, &provider);
        let session = new_session(provider, fetcher);

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert!(!verdict.certificates[0].within_validity);
    }

    #[test]
    fn test_time_selection() {
        let p = pkix(signer());
        let provider = fake_provider(&p, revoked(&p.leaf, day(11)));
        let fetcher = ocsp_fetcher(&p, &provider);
        let session = new_session(provider, fetcher);
        let anchors = [p.root.cert()];

        // The claimed time wins over the caller's date.
        let claimed = record(&p, &[b"inter crl", b"root crl"]).with_claimed_signing_time(day(12));
        let verdict = session.validate(&claimed, &anchors, day(10)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Invalid);
        assert_eq!(verdict.verification_time.unwrap().source, TimeSource::Claimed);
        assert!(!verdict.time_verified);

        // The timestamp wins over the claimed time.
        let stamped = claimed.clone().with_timestamp_time(day(10));
        let verdict = session.validate(&stamped, &anchors, day(15)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Valid, "{}", verdict.reason);
        assert_eq!(
            verdict.verification_time.unwrap().source,
            TimeSource::Timestamp
        );
        assert!(verdict.time_verified);
    }

    #[test]
    fn test_time_fallback_and_timestamp_requirement() {
        let p = pkix(signer());
        let anchors = [p.root.cert()];
        let crls: &[&[u8]] = &[b"inter crl", b"root crl"];

        let provider = fake_provider(&p, vec![]);
        let fetcher = ocsp_fetcher(&p, &provider);
        let config = ValidationConfig::default().with_time_fallback(TimeFallback::Reject);
        let session = ValidationSession::new(provider, fetcher, config);
        let verdict = session.validate(&record(&p, crls), &anchors, day(10)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert!(verdict.verification_time.is_none());

        let provider = fake_provider(&p, vec![]);
        let fetcher = ocsp_fetcher(&p, &provider);
        let config = ValidationConfig::default().with_required_timestamp(true);
        let session = ValidationSession::new(provider, fetcher, config);
        let verdict = session.validate(&record(&p, crls), &anchors, day(10)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Indeterminate);
        assert_eq!(verdict.reason, "signature carries no trusted timestamp");

        let stamped = record(&p, crls).with_timestamp_time(day(10));
        let verdict = session.validate(&stamped, &anchors, day(10)).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Valid, "{}", verdict.reason);
    }

    #[test]
    fn test_validate_all_keeps_order() {
        let p = pkix(signer());
        let provider = fake_provider(&p, revoked(&p.leaf, day(11)));
        let fetcher = ocsp_fetcher(&p, &provider);
        let session = new_session(provider, fetcher);

        let records = [
            record(&p, &[b"inter crl", b"root crl"]).with_timestamp_time(day(10)),
            record(&p, &[b"inter crl", b"root crl"]).with_timestamp_time(day(12)),
        ];
        let verdicts = session.validate_all(&records, &[p.root.cert()], day(1));
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].as_ref().unwrap().status, VerdictStatus::Valid);
        assert_eq!(verdicts[1].as_ref().unwrap().status, VerdictStatus::Invalid);
    }

    #[test]
    fn test_collect_ltv_evidence_after_validation() {
        let p = pkix(signer());
        let provider = fake_provider(&p, vec![]);
        let fetcher = ocsp_fetcher(&p, &provider);
        let session = new_session(provider, fetcher);

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        let chain = verdict.chain().unwrap();
        let calls = session.fetcher.calls().len();

        let evidence = session.collect_ltv_evidence(chain, day(10)).unwrap();
        let payloads: Vec<&[u8]> = evidence.iter().map(|e| &*e.der).collect();
        assert_eq!(
            payloads,
            [&b"inter crl"[..], &b"leaf ocsp"[..], &b"root crl"[..]]
        );
        assert!(evidence[0].covers.contains(&p.leaf.cert().id()));
        assert!(evidence[2].covers.contains(&p.inter.cert().id()));
        // Everything was known already.
        assert_eq!(session.fetcher.calls().len(), calls);

        assert_eq!(session.collect_ltv_evidence(chain, day(10)).unwrap(), evidence);
    }

    #[test]
    fn test_collect_ltv_evidence_fetches_gaps() {
        let mut pki = Pki::new();
        let root = pki.root("Root CA");
        let inter = pki.issue(
            &root,
            CertSpec::ca("Intermediate").crl("http://crl.example/root.crl"),
        );
        let leaf = pki.issue(
            &inter,
            CertSpec::leaf("Signer").crl("http://crl.example/inter.crl"),
        );
        let p = Pkix { root, inter, leaf };

        let provider = fake_provider(&p, vec![]);
        let fetcher = FakeFetcher::new()
            .respond("http://crl.example/inter.crl", Ok(b"inter crl".to_vec()))
            .respond("http://crl.example/root.crl", Ok(b"root crl".to_vec()));
        let session = new_session(provider, fetcher);

        let store = CertificateStore::new();
        store.add(p.inter.cert());
        let cancel = CancellationToken::new();
        let chain = ChainBuilder::new(&store, &crate::fetch::NoFetch, session.config(), &cancel)
            .build(&p.leaf.cert(), &[p.root.cert()])
            .unwrap();

        let evidence = session.collect_ltv_evidence(&chain, day(10)).unwrap();
        let payloads: Vec<&[u8]> = evidence.iter().map(|e| &*e.der).collect();
        assert_eq!(payloads, [&b"inter crl"[..], &b"root crl"[..]]);
        assert_eq!(session.evidence().len(), 2);
    }

    #[test]
    fn test_collect_ltv_evidence_skips_validity_assured() {
        let p = pkix(signer().validity_assured());
        let session = new_session(fake_provider(&p, vec![]), FakeFetcher::new());

        let verdict = session
            .validate(&record(&p, &[b"inter crl", b"root crl"]), &[p.root.cert()], day(10))
            .unwrap();
        let evidence = session
            .collect_ltv_evidence(verdict.chain().unwrap(), day(10))
            .unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(&*evidence[0].der, b"root crl");
        assert!(!session.evidence().has_evidence(&p.leaf.cert().id()));
    }
}

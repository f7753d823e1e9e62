//! The cryptographic seam of the engine.
//!
//! The engine never does cryptography itself. Everything that needs a
//! signature scheme, or an ASN.1 decoder for revocation artifacts, goes
//! through [`CryptoProvider`]. The `openssl` module provides the default
//! implementation.

use chrono::{DateTime, Utc};

use crate::certificate::Certificate;
use crate::revocation::RevocationArtifactError;
use crate::signature::{IntegrityResult, SignatureRecord};

/// One entry of a CRL's revoked list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedEntry {
    /// Normalized serial number (see [`crate::certificate::normalize_serial`]).
    pub serial: Vec<u8>,
    pub revoked_at: DateTime<Utc>,
}

/// A CRL whose signature was already verified against the expected issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCrl {
    /// DER encoding of the CRL issuer name.
    pub issuer: Vec<u8>,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub revoked: Vec<RevokedEntry>,
}

impl DecodedCrl {
    pub fn find(&self, serial: &[u8]) -> Option<&RevokedEntry> {
        self.revoked.iter().find(|entry| entry.serial == serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspCertStatus {
    Good,
    Revoked { revoked_at: DateTime<Utc> },
    Unknown,
}

/// The single response of an OCSP reply that matches the requested
/// certificate, after the responder signature was verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedOcsp {
    pub cert_status: OcspCertStatus,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
}

/// Cryptographic primitives and artifact decoding.
///
/// Implementations must be usable from several threads at once, because
/// revocation checks for different certificates run in parallel.
pub trait CryptoProvider: Sync {
    /// Verifies the signature over its declared byte ranges with the
    /// signer's public key.
    fn verify_signature(&self, record: &SignatureRecord<'_>) -> IntegrityResult;

    /// Whether `subject` carries a valid signature made with `issuer`'s key.
    fn verify_issued_by(&self, subject: &Certificate, issuer: &Certificate) -> bool;

    /// Decodes a CRL and verifies its signature against `issuer`.
    ///
    /// `at` is the verification date, for implementations that need a
    /// reference time to validate signer certificates.
    fn decode_crl(
        &self,
        der: &[u8],
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<DecodedCrl, RevocationArtifactError>;

    /// Builds a DER encoded OCSP request for `subject`.
    fn ocsp_request(
        &self,
        subject: &Certificate,
        issuer: &Certificate,
    ) -> Result<Vec<u8>, RevocationArtifactError>;

    /// Decodes an OCSP response, verifies the responder (the issuer itself
    /// or a delegated OCSP signer certified by it), and extracts the status
    /// of `subject`.
    ///
    /// Returns [`RevocationArtifactError::NotApplicable`] when the response
    /// says nothing about `subject`, whoever signed it.
    fn decode_ocsp(
        &self,
        der: &[u8],
        subject: &Certificate,
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<DecodedOcsp, RevocationArtifactError>;
}

impl<P: CryptoProvider + ?Sized> CryptoProvider for &P {
    fn verify_signature(&self, record: &SignatureRecord<'_>) -> IntegrityResult {
        (**self).verify_signature(record)
    }

    fn verify_issued_by(&self, subject: &Certificate, issuer: &Certificate) -> bool {
        (**self).verify_issued_by(subject, issuer)
    }

    fn decode_crl(
        &self,
        der: &[u8],
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<DecodedCrl, RevocationArtifactError> {
        (**self).decode_crl(der, issuer, at)
    }

    fn ocsp_request(
        &self,
        subject: &Certificate,
        issuer: &Certificate,
    ) -> Result<Vec<u8>, RevocationArtifactError> {
        (**self).ocsp_request(subject, issuer)
    }

    fn decode_ocsp(
        &self,
        der: &[u8],
        subject: &Certificate,
        issuer: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<DecodedOcsp, RevocationArtifactError> {
        (**self).decode_ocsp(der, subject, issuer, at)
    }
}

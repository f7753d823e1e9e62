//! What the validation engine needs to know about one signature.

use std::ops::Range;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::certificate::Certificate;

/// Malformed signature container. Fatal for the signature it belongs to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("signature covers no bytes")]
    EmptyCoverage,
    #[error("byte range {0:?} is empty or reversed")]
    InvalidRange(Range<usize>),
    #[error("byte range {0:?} goes past the end of the document ({1} bytes)")]
    OutOfBounds(Range<usize>, usize),
    #[error("byte ranges overlap or are out of order")]
    Overlapping,
    #[error("signature container is empty")]
    EmptySignature,
    #[error("malformed signature container: {0}")]
    Container(String),
}

/// Outcome of the cryptographic check of a signature over its byte ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityResult {
    pub intact: bool,
    pub reason: String,
}

impl IntegrityResult {
    pub fn intact() -> Self {
        IntegrityResult {
            intact: true,
            reason: "signature matches the signed bytes".to_string(),
        }
    }

    pub fn broken(reason: impl Into<String>) -> Self {
        IntegrityResult {
            intact: false,
            reason: reason.into(),
        }
    }
}

/// Revocation artifacts found next to the signature, either inside the
/// signature container or in the document security store.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedRevocationData {
    pub crls: Vec<Vec<u8>>,
    pub ocsp_responses: Vec<Vec<u8>>,
}

impl EmbeddedRevocationData {
    pub fn is_empty(&self) -> bool {
        self.crls.is_empty() && self.ocsp_responses.is_empty()
    }

    pub fn extend(&mut self, other: EmbeddedRevocationData) {
        self.crls.extend(other.crls);
        self.ocsp_responses.extend(other.ocsp_responses);
    }
}

/// A signature to be validated.
///
/// The signer's claimed time is whatever the signer wrote into the
/// document, and is not trusted. The timestamp time comes from a trusted
/// timestamp authority token, when one is present.
#[derive(Debug, Clone)]
pub struct SignatureRecord<'a> {
    pub document: &'a [u8],
    pub byte_ranges: Vec<Range<usize>>,
    /// The encoded signature container, e.g. a BER encoded PKCS #7.
    pub signature: Vec<u8>,
    pub signer: Certificate,
    /// Other certificates shipped with the signature. Untrusted, only used
    /// to help building the chain.
    pub certificates: Vec<Certificate>,
    pub claimed_signing_time: Option<DateTime<Utc>>,
    pub timestamp_time: Option<DateTime<Utc>>,
    pub embedded_revocation: EmbeddedRevocationData,
}

impl<'a> SignatureRecord<'a> {
    pub fn new(
        document: &'a [u8],
        byte_ranges: Vec<Range<usize>>,
        signature: Vec<u8>,
        signer: Certificate,
    ) -> Self {
        SignatureRecord {
            document,
            byte_ranges,
            signature,
            signer,
            certificates: Vec::new(),
            claimed_signing_time: None,
            timestamp_time: None,
            embedded_revocation: EmbeddedRevocationData::default(),
        }
    }

    pub fn with_certificates(mut self, certificates: Vec<Certificate>) -> Self {
        self.certificates = certificates;
        self
    }

    pub fn with_claimed_signing_time(mut self, time: DateTime<Utc>) -> Self {
        self.claimed_signing_time = Some(time);
        self
    }

    pub fn with_timestamp_time(mut self, time: DateTime<Utc>) -> Self {
        self.timestamp_time = Some(time);
        self
    }

    pub fn with_embedded_revocation(mut self, data: EmbeddedRevocationData) -> Self {
        self.embedded_revocation = data;
        self
    }

    /// Checks that the byte ranges are well formed: not empty, inside the
    /// document, ascending and disjoint.
    pub fn check_structure(&self) -> Result<(), StructuralError> {
        if self.byte_ranges.is_empty() {
            return Err(StructuralError::EmptyCoverage);
        }
        if self.signature.is_empty() {
            return Err(StructuralError::EmptySignature);
        }

        let mut previous_end = None;
        for range in &self.byte_ranges {
            if range.start >= range.end {
                return Err(StructuralError::InvalidRange(range.clone()));
            }
            if range.end > self.document.len() {
                return Err(StructuralError::OutOfBounds(
                    range.clone(),
                    self.document.len(),
                ));
            }
            if previous_end.is_some_and(|end| range.start < end) {
                return Err(StructuralError::Overlapping);
            }
            previous_end = Some(range.end);
        }
        Ok(())
    }

    /// The signed slices of the document. Only meaningful after
    /// [`Self::check_structure`] succeeded.
    pub fn signed_data(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.byte_ranges
            .iter()
            .map(|range| &self.document[range.clone()])
    }
}

#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

pub mod certificate;
pub mod chain;
pub mod config;
pub mod evidence;
pub mod fetch;
pub mod pdf;
pub mod provider;
pub mod revocation;
pub mod signature;
pub mod store;
pub mod verifier;

#[cfg(feature = "openssl")]
pub mod openssl;

#[cfg(all(test, feature = "openssl"))]
mod testutil;

use thiserror::Error;

pub use certificate::{CertId, Certificate};
pub use chain::{CertificateChain, ChainBuilder, ChainError};
pub use config::{TimeFallback, ValidationConfig};
pub use evidence::{EvidenceKind, EvidenceStore, RevocationEvidence};
pub use fetch::{CancellationToken, FetchError, Fetcher, NoFetch};
pub use provider::CryptoProvider;
pub use revocation::{Exemption, ExemptionPolicy, RevocationState, RevocationStatus};
pub use signature::{EmbeddedRevocationData, IntegrityResult, SignatureRecord, StructuralError};
pub use store::CertificateStore;
pub use verifier::{
    validate, ValidationSession, ValidationVerdict, VerdictStatus, VerificationTime,
};

#[cfg(feature = "http")]
pub use fetch::HttpFetcher;

/// Failures that stop a validation run without a verdict.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("no trust anchors were supplied")]
    NoTrustAnchors,
    #[error("validation was cancelled")]
    Cancelled,
}

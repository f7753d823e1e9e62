//! Optional OpenSSL module for the cryptographic operations.
//!
//! This module provides an OpenSSL-based implementation of the
//! [`CryptoProvider`]. See [`OpenSslProvider`]. It is enabled by the
//! `openssl` feature.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use openssl::asn1::Asn1GeneralizedTimeRef;
use openssl::hash::MessageDigest;
use openssl::ocsp::{
    OcspCertId, OcspCertStatus as OsslCertStatus, OcspFlag, OcspRequest, OcspResponse,
    OcspResponseStatus,
};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::{
    store::{X509Store, X509StoreBuilder},
    verify::X509VerifyFlags,
    X509Crl, X509,
};
use x509_parser::{prelude::FromDer, revocation_list::CertificateRevocationList, time::ASN1Time};

use crate::certificate::{self, normalize_serial, Certificate};
use crate::pdf::SignatureField;
use crate::provider::{
    CryptoProvider, DecodedCrl, DecodedOcsp, OcspCertStatus, RevokedEntry,
};
use crate::revocation::RevocationArtifactError;
use crate::signature::{EmbeddedRevocationData, IntegrityResult, SignatureRecord};

/// OpenSSL implementation of the crypto provider.
///
/// Certificate path validation is not delegated to OpenSSL: chains are built
/// and checked by the engine, OpenSSL only checks individual signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenSslProvider;

impl OpenSslProvider {
    pub fn new() -> Self {
        OpenSslProvider
    }
}

fn to_x509(cert: &Certificate) -> Result<X509, openssl::error::ErrorStack> {
    X509::from_der(cert.der())
}

fn empty_store() -> Result<X509Store, openssl::error::ErrorStack> {
    Ok(X509StoreBuilder::new()?.build())
}

fn malformed(err: impl std::fmt::Display) -> RevocationArtifactError {
    RevocationArtifactError::Malformed(err.to_string())
}

fn utc(time: ASN1Time) -> Result<DateTime<Utc>, RevocationArtifactError> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .ok_or_else(|| malformed(format!("time out of range: {time}")))
}

/// Reads an OCSP GeneralizedTime. OpenSSL only exposes these through
/// `ASN1_GENERALIZEDTIME_print`, which always writes
/// "Mmm DD HH:MM:SS[.fff] YYYY GMT".
fn generalized_time(time: &Asn1GeneralizedTimeRef) -> Result<DateTime<Utc>, RevocationArtifactError> {
    let text = time.to_string();
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S%.f %Y GMT")
        .map(|t| t.and_utc())
        .map_err(|_| malformed(format!("unsupported time {text:?}")))
}

impl OpenSslProvider {
    fn try_verify_signature(&self, record: &SignatureRecord<'_>) -> anyhow::Result<()> {
        // Unfortunately OpenSSL requires a contiguous array of bytes to verify
        // the signature, so we must allocate and copy the slices.
        let mut contiguous =
            Vec::with_capacity(record.byte_ranges.iter().map(|r| r.len()).sum());
        for slice in record.signed_data() {
            contiguous.extend_from_slice(slice);
        }

        let pkcs7 = Pkcs7::from_der(&record.signature)?;
        let mut certs = Stack::new()?;
        certs.push(to_x509(&record.signer)?)?;
        let store = empty_store()?;

        // Only the digest and the signer's key are checked here. Whether the
        // signer is trusted is decided by the chain building.
        pkcs7.verify(
            &certs,
            &store,
            Some(&contiguous),
            None,
            Pkcs7Flags::NOVERIFY,
        )?;

        let signers = pkcs7.signers(&certs, Pkcs7Flags::empty())?;
        let signed_by_signer = signers
            .iter()
            .map(|s| s.to_der())
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .any(|der| der.as_slice() == record.signer.der());
        if !signed_by_signer {
            anyhow::bail!("signature was not made by {}", record.signer.subject());
        }
        Ok(())
    }
}

impl CryptoProvider for OpenSslProvider {
    fn verify_signature(&self, record: &SignatureRecord<'_>) -> IntegrityResult {
        match self.try_verify_signature(record) {
            Ok(()) => IntegrityResult::intact(),
            Err(err) => IntegrityResult::broken(err.to_string()),
        }
    }

    fn verify_issued_by(&self, subject: &Certificate, issuer: &Certificate) -> bool {
        let check = || -> Result<bool, openssl::error::ErrorStack> {
            let key = to_x509(issuer)?.public_key()?;
            to_x509(subject)?.verify(&key)
        };
        check().unwrap_or(false)
    }

    fn decode_crl(
        &self,
        der: &[u8],
        issuer: &Certificate,
        _at: DateTime<Utc>,
    ) -> Result<DecodedCrl, RevocationArtifactError> {
        let (_, parsed) = CertificateRevocationList::from_der(der).map_err(malformed)?;

        let issuer_name = parsed.issuer().as_raw();
        if issuer_name != issuer.subject().as_der() {
            return Err(RevocationArtifactError::NotApplicable);
        }

        let crl = X509Crl::from_der(der).map_err(malformed)?;
        let key = to_x509(issuer)
            .and_then(|cert| cert.public_key())
            .map_err(malformed)?;
        if !crl.verify(&key).unwrap_or(false) {
            return Err(RevocationArtifactError::BadSignature(format!(
                "CRL is not signed by {}",
                issuer.subject()
            )));
        }

        let revoked = parsed
            .iter_revoked_certificates()
            .map(|entry| {
                Ok(RevokedEntry {
                    serial: normalize_serial(entry.raw_serial()).to_vec(),
                    revoked_at: utc(entry.revocation_date)?,
                })
            })
            .collect::<Result<Vec<_>, RevocationArtifactError>>()?;

        Ok(DecodedCrl {
            issuer: issuer_name.to_vec(),
            this_update: utc(parsed.last_update())?,
            next_update: parsed.next_update().map(utc).transpose()?,
            revoked,
        })
    }

    fn ocsp_request(
        &self,
        subject: &Certificate,
        issuer: &Certificate,
    ) -> Result<Vec<u8>, RevocationArtifactError> {
        let build = || -> Result<Vec<u8>, openssl::error::ErrorStack> {
            let subject = to_x509(subject)?;
            let issuer = to_x509(issuer)?;
            let id = OcspCertId::from_cert(MessageDigest::sha1(), &subject, &issuer)?;
            let mut request = OcspRequest::new()?;
            request.add_id(id)?;
            request.to_der()
        };
        build().map_err(malformed)
    }

    fn decode_ocsp(
        &self,
        der: &[u8],
        subject: &Certificate,
        issuer: &Certificate,
        _at: DateTime<Utc>,
    ) -> Result<DecodedOcsp, RevocationArtifactError> {
        let response = OcspResponse::from_der(der).map_err(malformed)?;
        if response.status() != OcspResponseStatus::SUCCESSFUL {
            return Err(RevocationArtifactError::Unsuccessful(format!(
                "with status {}",
                response.status().as_raw()
            )));
        }
        let basic = response.basic().map_err(malformed)?;

        // Documents often carry responses about other certificates of the
        // chain, so the subject is matched before any signature is checked.
        let subject_x509 = to_x509(subject).map_err(malformed)?;
        let issuer_x509 = to_x509(issuer).map_err(malformed)?;
        let id = OcspCertId::from_cert(MessageDigest::sha1(), &subject_x509, &issuer_x509)
            .map_err(malformed)?;
        let status = basic
            .find_status(&id)
            .ok_or(RevocationArtifactError::NotApplicable)?;

        let store = (|| {
            let mut builder = X509StoreBuilder::new()?;
            builder.add_cert(issuer_x509.clone())?;
            // The issuer is trusted for this purpose only. Validity periods
            // are judged by the engine against the verification date, not
            // by OpenSSL against the current time.
            builder.set_flags(X509VerifyFlags::PARTIAL_CHAIN | X509VerifyFlags::NO_CHECK_TIME)?;
            Ok::<_, openssl::error::ErrorStack>(builder.build())
        })()
        .map_err(malformed)?;
        let mut certs = Stack::new().map_err(malformed)?;
        certs.push(issuer_x509.clone()).map_err(malformed)?;
        basic
            .verify(&certs, &store, OcspFlag::empty())
            .map_err(|e| RevocationArtifactError::BadSignature(e.to_string()))?;

        let cert_status = if status.status == OsslCertStatus::GOOD {
            OcspCertStatus::Good
        } else if status.status == OsslCertStatus::REVOKED {
            let revoked_at = status
                .revocation_time
                .ok_or_else(|| malformed("revoked status without a revocation time"))?;
            OcspCertStatus::Revoked {
                revoked_at: generalized_time(revoked_at)?,
            }
        } else {
            OcspCertStatus::Unknown
        };

        Ok(DecodedOcsp {
            cert_status,
            this_update: generalized_time(status.this_update)?,
            next_update: status.next_update().map(generalized_time).transpose()?,
        })
    }
}

/// Builds the [`SignatureRecord`] of a signature field, extracting the
/// signer and the certificates shipped in its PKCS #7 container.
///
/// Timestamp tokens are not decoded, so the record never carries a trusted
/// timestamp time.
pub fn signature_record<'a>(
    document: &'a [u8],
    field: &SignatureField,
    embedded: &EmbeddedRevocationData,
) -> anyhow::Result<SignatureRecord<'a>> {
    let pkcs7 = Pkcs7::from_der(&field.contents).context("decoding the signature container")?;

    let no_extra_certs = Stack::<X509>::new()?;
    let signers = pkcs7.signers(&no_extra_certs, Pkcs7Flags::empty())?;
    let signer = signers
        .iter()
        .next()
        .context("signature container names no signer")?;
    let signer = Certificate::from_der(&signer.to_der()?)?;

    let mut certificates = Vec::new();
    if let Some(shipped) = pkcs7.signed().and_then(|signed| signed.certificates()) {
        for cert in shipped {
            let cert = Certificate::from_der(&cert.to_der()?)?;
            if cert != signer {
                certificates.push(cert);
            }
        }
    }

    let mut record = SignatureRecord::new(
        document,
        field.byte_ranges.to_vec(),
        field.contents.clone(),
        signer,
    )
    .with_certificates(certificates)
    .with_embedded_revocation(embedded.clone());
    if let Some(time) = field.claimed_signing_time {
        record = record.with_claimed_signing_time(time);
    }
    Ok(record)
}

/// Loads trust anchors from a directory of PEM or DER files.
pub fn load_trust_anchors_from_dir<P: AsRef<Path>>(dir: P) -> anyhow::Result<Vec<Certificate>> {
    let mut anchors = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let certs: Vec<Certificate> = certificate::parse_certificates(&std::fs::read(&path)?)
            .with_context(|| format!("loading {}", path.display()))?;
        log::debug!("{} trust anchors from {}", certs.len(), path.display());
        anchors.extend(certs);
    }
    Ok(anchors)
}

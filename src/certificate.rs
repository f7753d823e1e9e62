//! Parsed X.509 certificates.
//!
//! A [`Certificate`] is an owned, immutable view over the fields the chain
//! builder and the revocation resolvers need. It is parsed once, with
//! `x509-parser`, and never changes afterwards.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use cms::{cert::CertificateChoices, content_info::ContentInfo, signed_data::SignedData};
use der::{Decode, Encode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::{
    certificate::X509Certificate,
    extensions::{DistributionPointName, GeneralName, ParsedExtension},
    pem::parse_x509_pem,
    prelude::FromDer,
    x509::X509Name,
};

/// OID of the ETSI "validity assured - short term" certificate extension
/// (ETSI EN 319 412-1, id-etsi-ext-valassured-ST-certs).
const OID_VALIDITY_ASSURED_SHORT_TERM: &str = "0.4.0.194121.2.1";

const OID_AD_CA_ISSUERS: &str = "1.3.6.1.5.5.7.48.2";
const OID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed certificate: {0}")]
    Malformed(String),
    #[error("trailing data after certificate")]
    TrailingData,
    #[error("validity time out of range")]
    InvalidTime,
    #[error("no certificate found in input")]
    Empty,
}

/// Identity of a certificate: the SHA-256 digest of its DER encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertId([u8; 32]);

impl CertId {
    pub fn of(der: &[u8]) -> Self {
        CertId(Sha256::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for CertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertId({self})")
    }
}

impl fmt::Display for CertId {
    /// Short hex prefix, enough to tell certificates apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A distinguished name. Compared by its DER encoding, displayed in the
/// usual RFC 4514-like form.
#[derive(Clone)]
pub struct DistinguishedName {
    raw: Vec<u8>,
    display: String,
}

impl DistinguishedName {
    fn from_x509(name: &X509Name) -> Self {
        DistinguishedName {
            raw: name.as_raw().to_vec(),
            display: name.to_string(),
        }
    }

    pub fn as_der(&self) -> &[u8] {
        &self.raw
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for DistinguishedName {}

impl std::hash::Hash for DistinguishedName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Debug for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.display)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// An immutable, parsed X.509 certificate.
#[derive(Clone)]
pub struct Certificate {
    id: CertId,
    der: Vec<u8>,
    subject: DistinguishedName,
    issuer: DistinguishedName,
    serial: Vec<u8>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_key: Vec<u8>,
    ca_issuer_uris: Vec<String>,
    ocsp_uris: Vec<String>,
    crl_uris: Vec<String>,
    subject_key_id: Option<Vec<u8>>,
    authority_key_id: Option<Vec<u8>>,
    validity_assured: bool,
}

impl Certificate {
    /// Parses a single DER encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let (rest, cert) =
            X509Certificate::from_der(der).map_err(|e| Error::Malformed(e.to_string()))?;
        if !rest.is_empty() {
            return Err(Error::TrailingData);
        }

        let mut ca_issuer_uris = Vec::new();
        let mut ocsp_uris = Vec::new();
        let mut crl_uris = Vec::new();
        let mut subject_key_id = None;
        let mut authority_key_id = None;
        let mut validity_assured = false;

        for ext in cert.extensions() {
            if ext.oid.to_id_string() == OID_VALIDITY_ASSURED_SHORT_TERM {
                validity_assured = true;
                continue;
            }

            match ext.parsed_extension() {
                ParsedExtension::AuthorityInfoAccess(aia) => {
                    for desc in &aia.accessdescs {
                        let GeneralName::URI(uri) = &desc.access_location else {
                            continue;
                        };
                        match desc.access_method.to_id_string().as_str() {
                            OID_AD_CA_ISSUERS => ca_issuer_uris.push(uri.to_string()),
                            OID_AD_OCSP => ocsp_uris.push(uri.to_string()),
                            _ => {}
                        }
                    }
                }
                ParsedExtension::CRLDistributionPoints(points) => {
                    for point in points.points.iter() {
                        let Some(DistributionPointName::FullName(names)) =
                            &point.distribution_point
                        else {
                            continue;
                        };
                        for name in names {
                            if let GeneralName::URI(uri) = name {
                                crl_uris.push(uri.to_string());
                            }
                        }
                    }
                }
                ParsedExtension::SubjectKeyIdentifier(id) => subject_key_id = Some(id.0.to_vec()),
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    authority_key_id = aki.key_identifier.as_ref().map(|id| id.0.to_vec());
                }
                _ => {}
            }
        }

        let validity = cert.validity();
        Ok(Certificate {
            id: CertId::of(der),
            der: der.to_vec(),
            subject: DistinguishedName::from_x509(cert.subject()),
            issuer: DistinguishedName::from_x509(cert.issuer()),
            serial: normalize_serial(cert.raw_serial()).to_vec(),
            not_before: unix_to_utc(validity.not_before.timestamp())?,
            not_after: unix_to_utc(validity.not_after.timestamp())?,
            public_key: cert.public_key().raw.to_vec(),
            ca_issuer_uris,
            ocsp_uris,
            crl_uris,
            subject_key_id,
            authority_key_id,
            validity_assured,
        })
    }

    /// Parses the first PEM block of the input.
    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        let (_, pem) = parse_x509_pem(pem).map_err(|e| Error::Malformed(e.to_string()))?;
        Self::from_der(&pem.contents)
    }

    pub fn id(&self) -> CertId {
        self.id
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn issuer(&self) -> &DistinguishedName {
        &self.issuer
    }

    /// Serial number as big-endian bytes, without leading zeros.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// DER encoded SubjectPublicKeyInfo.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// CA issuer URIs from the Authority Information Access extension.
    pub fn ca_issuer_uris(&self) -> &[String] {
        &self.ca_issuer_uris
    }

    /// OCSP responder URIs from the Authority Information Access extension.
    pub fn ocsp_uris(&self) -> &[String] {
        &self.ocsp_uris
    }

    pub fn crl_uris(&self) -> &[String] {
        &self.crl_uris
    }

    pub fn subject_key_id(&self) -> Option<&[u8]> {
        self.subject_key_id.as_deref()
    }

    /// Key identifier of the issuer's key, when the certificate names it.
    pub fn authority_key_id(&self) -> Option<&[u8]> {
        self.authority_key_id.as_deref()
    }

    /// Whether the certificate carries the "validity assured - short term"
    /// extension, meaning its issuer does not publish revocation data for it.
    pub fn is_validity_assured(&self) -> bool {
        self.validity_assured
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Whether `at` is inside [notBefore, notAfter].
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// Parses what an AIA "caIssuers" endpoint or a trust store file may serve:
/// one DER certificate, a PKCS #7 certs-only bundle (".p7c"), or any number
/// of PEM blocks holding either.
pub fn parse_certificates(bytes: &[u8]) -> Result<Vec<Certificate>, Error> {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    if bytes[start..].starts_with(b"-----BEGIN") {
        let mut certs = Vec::new();
        for pem in x509_parser::pem::Pem::iter_from_buffer(bytes) {
            let pem = pem.map_err(|e| Error::Malformed(e.to_string()))?;
            match pem.label.as_str() {
                "PKCS7" | "CMS" => certs.extend(parse_pkcs7_certificates(&pem.contents)?),
                _ => certs.push(Certificate::from_der(&pem.contents)?),
            }
        }
        if certs.is_empty() {
            return Err(Error::Empty);
        }
        Ok(certs)
    } else {
        match Certificate::from_der(bytes) {
            Ok(cert) => Ok(vec![cert]),
            Err(err) => parse_pkcs7_certificates(bytes).map_err(|_| err),
        }
    }
}

/// Certificates carried by a PKCS #7 SignedData structure.
fn parse_pkcs7_certificates(der: &[u8]) -> Result<Vec<Certificate>, Error> {
    let malformed = |e: der::Error| Error::Malformed(e.to_string());
    let content_info = ContentInfo::from_der(der).map_err(malformed)?;
    let signed_data =
        SignedData::from_der(&content_info.content.to_der().map_err(malformed)?)
            .map_err(malformed)?;

    let mut certs = Vec::new();
    if let Some(set) = &signed_data.certificates {
        for choice in set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                certs.push(Certificate::from_der(&cert.to_der().map_err(malformed)?)?);
            }
        }
    }
    if certs.is_empty() {
        return Err(Error::Empty);
    }
    Ok(certs)
}

/// Strips the sign-padding zeros of an encoded INTEGER, so serials from
/// different encoders compare equal.
pub fn normalize_serial(serial: &[u8]) -> &[u8] {
    let start = serial
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(serial.len().saturating_sub(1));
    &serial[start..]
}

fn unix_to_utc(secs: i64) -> Result<DateTime<Utc>, Error> {
    Utc.timestamp_opt(secs, 0).single().ok_or(Error::InvalidTime)
}

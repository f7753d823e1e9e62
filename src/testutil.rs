//! Test fixtures: a throwaway PKI generated with OpenSSL, plus scripted
//! stand-ins for the crypto provider and the fetcher.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use openssl::{
    asn1::{Asn1Object, Asn1OctetString, Asn1Time},
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkcs7::{Pkcs7, Pkcs7Flags},
    pkey::{PKey, Private},
    stack::Stack,
    x509::{
        extension::{AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectKeyIdentifier},
        X509Builder, X509Extension, X509Name, X509NameBuilder, X509,
    },
};
use parking_lot::Mutex;

use crate::certificate::{CertId, Certificate};
use crate::fetch::{FetchError, Fetcher};
use crate::provider::{CryptoProvider, DecodedCrl, DecodedOcsp};
use crate::revocation::RevocationArtifactError;
use crate::signature::{IntegrityResult, SignatureRecord};

/// Midnight UTC of the given day of January 2024.
pub fn day(n: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, n, 0, 0, 0).unwrap()
}

/// A file of `test_data/pki`, made with the `openssl` command line tool by
/// `test_data/pki/generate.sh`.
pub fn fixture(name: &str) -> Vec<u8> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("test_data/pki")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("{}: {err}", path.display()))
}

pub fn fixture_cert(name: &str) -> Certificate {
    Certificate::from_der(&fixture(name)).unwrap()
}

/// A generated certificate with its private key.
#[derive(Clone)]
pub struct Issued {
    pub der: Vec<u8>,
    pub pem: Vec<u8>,
    pub x509: X509,
    pub key: PKey<Private>,
}

impl Issued {
    pub fn cert(&self) -> Certificate {
        Certificate::from_der(&self.der).unwrap()
    }
}

pub struct CertSpec {
    cn: String,
    ca: bool,
    issuer_name: Option<String>,
    ca_issuers: Vec<String>,
    ocsp: Vec<String>,
    crl: Vec<String>,
    validity_assured: bool,
    key_ids: bool,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertSpec {
    fn new(cn: &str, ca: bool) -> Self {
        CertSpec {
            cn: cn.to_string(),
            ca,
            issuer_name: None,
            ca_issuers: Vec::new(),
            ocsp: Vec::new(),
            crl: Vec::new(),
            validity_assured: false,
            key_ids: true,
            not_before: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    pub fn leaf(cn: &str) -> Self {
        Self::new(cn, false)
    }

    pub fn ca(cn: &str) -> Self {
        Self::new(cn, true)
    }

    /// Claims to be issued by `cn` regardless of who actually signs.
    pub fn issuer_name(mut self, cn: &str) -> Self {
        self.issuer_name = Some(cn.to_string());
        self
    }

    pub fn ca_issuers(mut self, uri: &str) -> Self {
        self.ca_issuers.push(uri.to_string());
        self
    }

    pub fn ocsp(mut self, uri: &str) -> Self {
        self.ocsp.push(uri.to_string());
        self
    }

    pub fn crl(mut self, uri: &str) -> Self {
        self.crl.push(uri.to_string());
        self
    }

    pub fn validity_assured(mut self) -> Self {
        self.validity_assured = true;
        self
    }

    /// Leaves out the subject and authority key identifiers.
    pub fn without_key_ids(mut self) -> Self {
        self.key_ids = false;
        self
    }

    pub fn valid(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }
}

pub struct Pki {
    serial: u32,
}

impl Pki {
    pub fn new() -> Self {
        Pki { serial: 0 }
    }

    pub fn root(&mut self, cn: &str) -> Issued {
        let key = new_key();
        self.build(CertSpec::ca(cn), &key, None, &key)
    }

    pub fn issue(&mut self, issuer: &Issued, spec: CertSpec) -> Issued {
        let key = new_key();
        self.build(spec, &key, Some(issuer), &issuer.key)
    }

    #[allow(deprecated)]
    fn build(
        &mut self,
        spec: CertSpec,
        key: &PKey<Private>,
        issuer: Option<&Issued>,
        signing_key: &PKey<Private>,
    ) -> Issued {
        self.serial += 1;

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(self.serial).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();

        let subject = name(&spec.cn);
        builder.set_subject_name(&subject).unwrap();
        match (&spec.issuer_name, issuer) {
            (Some(cn), _) => builder.set_issuer_name(&name(cn)).unwrap(),
            (None, Some(issuer)) => builder
                .set_issuer_name(issuer.x509.subject_name())
                .unwrap(),
            (None, None) => builder.set_issuer_name(&subject).unwrap(),
        }
        builder.set_pubkey(key).unwrap();
        builder
            .set_not_before(&Asn1Time::from_unix(spec.not_before.timestamp()).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(spec.not_after.timestamp()).unwrap())
            .unwrap();

        if spec.key_ids {
            let ski = SubjectKeyIdentifier::new()
                .build(&builder.x509v3_context(None, None))
                .unwrap();
            builder.append_extension(ski).unwrap();
            if let Some(issuer) = issuer {
                let aki = AuthorityKeyIdentifier::new()
                    .keyid(false)
                    .build(&builder.x509v3_context(Some(&*issuer.x509), None))
                    .unwrap();
                builder.append_extension(aki).unwrap();
            }
        }

        if spec.ca {
            builder
                .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
                .unwrap();
            builder
                .append_extension(
                    KeyUsage::new()
                        .critical()
                        .key_cert_sign()
                        .crl_sign()
                        .build()
                        .unwrap(),
                )
                .unwrap();
        }

        let access: Vec<String> = spec
            .ca_issuers
            .iter()
            .map(|uri| format!("caIssuers;URI:{uri}"))
            .chain(spec.ocsp.iter().map(|uri| format!("OCSP;URI:{uri}")))
            .collect();
        if !access.is_empty() {
            let ext =
                X509Extension::new(None, None, "authorityInfoAccess", &access.join(",")).unwrap();
            builder.append_extension(ext).unwrap();
        }

        if !spec.crl.is_empty() {
            let points: Vec<String> = spec.crl.iter().map(|uri| format!("URI:{uri}")).collect();
            let ext =
                X509Extension::new(None, None, "crlDistributionPoints", &points.join(",")).unwrap();
            builder.append_extension(ext).unwrap();
        }

        if spec.validity_assured {
            let oid = Asn1Object::from_str("0.4.0.194121.2.1").unwrap();
            // The extension value is an ASN.1 NULL.
            let value = Asn1OctetString::new_from_bytes(&[0x05, 0x00]).unwrap();
            let ext = X509Extension::new_from_der(&oid, false, &value).unwrap();
            builder.append_extension(ext).unwrap();
        }

        builder.sign(signing_key, MessageDigest::sha256()).unwrap();
        let x509 = builder.build();

        Issued {
            der: x509.to_der().unwrap(),
            pem: x509.to_pem().unwrap(),
            x509,
            key: key.clone(),
        }
    }
}

fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn name(cn: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    builder.build()
}

/// Detached PKCS #7 signature of `data` by `signer`, shipping `extra`
/// certificates along.
pub fn sign_detached(signer: &Issued, extra: &[&Issued], data: &[u8]) -> Vec<u8> {
    let mut certs = Stack::new().unwrap();
    for cert in extra {
        certs.push(cert.x509.clone()).unwrap();
    }
    Pkcs7::sign(
        &signer.x509,
        &signer.key,
        &certs,
        data,
        Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
    )
    .unwrap()
    .to_der()
    .unwrap()
}

/// A crypto provider whose answers are a lookup table keyed by the raw
/// artifact bytes.
#[derive(Default)]
pub struct FakeProvider {
    crls: HashMap<Vec<u8>, DecodedCrl>,
    ocsp: HashMap<Vec<u8>, (CertId, DecodedOcsp)>,
    bad_signatures: HashSet<Vec<u8>>,
    broken_links: HashSet<CertId>,
    wrong_issuers: HashSet<(CertId, CertId)>,
    tampered: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn crl(mut self, der: &[u8], crl: DecodedCrl) -> Self {
        self.crls.insert(der.to_vec(), crl);
        self
    }

    /// `der` decodes to `response`, which is about `subject` only.
    pub fn ocsp(mut self, der: &[u8], subject: &Certificate, response: DecodedOcsp) -> Self {
        self.ocsp.insert(der.to_vec(), (subject.id(), response));
        self
    }

    pub fn bad_signature(mut self, der: &[u8]) -> Self {
        self.bad_signatures.insert(der.to_vec());
        self
    }

    /// The signature on `subject` does not verify with its issuer's key.
    pub fn broken_link(mut self, subject: &Certificate) -> Self {
        self.broken_links.insert(subject.id());
        self
    }

    /// The signature on `subject` does not verify with the key of `issuer`
    /// in particular.
    pub fn wrong_issuer(mut self, subject: &Certificate, issuer: &Certificate) -> Self {
        self.wrong_issuers.insert((subject.id(), issuer.id()));
        self
    }

    /// Document signatures no longer match their signed bytes.
    pub fn tampered(mut self) -> Self {
        self.tampered = true;
        self
    }

    pub fn request_for(&self, subject: &Certificate) -> Vec<u8> {
        subject.id().as_bytes().to_vec()
    }
}

impl CryptoProvider for FakeProvider {
    fn verify_signature(&self, _record: &SignatureRecord<'_>) -> IntegrityResult {
        if self.tampered {
            IntegrityResult::broken("message digest mismatch")
        } else {
            IntegrityResult::intact()
        }
    }

    fn verify_issued_by(&self, subject: &Certificate, issuer: &Certificate) -> bool {
        !self.broken_links.contains(&subject.id())
            && !self.wrong_issuers.contains(&(subject.id(), issuer.id()))
    }

    fn decode_crl(
        &self,
        der: &[u8],
        _issuer: &Certificate,
        _at: DateTime<Utc>,
    ) -> Result<DecodedCrl, RevocationArtifactError> {
        if self.bad_signatures.contains(der) {
            return Err(RevocationArtifactError::BadSignature("forged".to_string()));
        }
        self.crls
            .get(der)
            .cloned()
            .ok_or_else(|| RevocationArtifactError::Malformed("not a CRL".to_string()))
    }

    fn ocsp_request(
        &self,
        subject: &Certificate,
        _issuer: &Certificate,
    ) -> Result<Vec<u8>, RevocationArtifactError> {
        Ok(self.request_for(subject))
    }

    fn decode_ocsp(
        &self,
        der: &[u8],
        subject: &Certificate,
        _issuer: &Certificate,
        _at: DateTime<Utc>,
    ) -> Result<DecodedOcsp, RevocationArtifactError> {
        if self.bad_signatures.contains(der) {
            return Err(RevocationArtifactError::BadSignature("forged".to_string()));
        }
        match self.ocsp.get(der) {
            Some((id, response)) if *id == subject.id() => Ok(response.clone()),
            Some(_) => Err(RevocationArtifactError::NotApplicable),
            None => Err(RevocationArtifactError::Malformed(
                "not an OCSP response".to_string(),
            )),
        }
    }
}

/// A fetcher serving canned responses, and remembering what was asked.
#[derive(Default)]
pub struct FakeFetcher {
    responses: HashMap<String, Result<Vec<u8>, FetchError>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, uri: &str, response: Result<Vec<u8>, FetchError>) -> Self {
        self.responses.insert(uri.to_string(), response);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, uri: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
        self.calls.lock().push(uri.to_string());
        self.responses.get(uri).cloned().unwrap_or_else(|| {
            Err(FetchError::Unreachable(
                uri.to_string(),
                "no such host".to_string(),
            ))
        })
    }
}

//! PDF side of the engine: finding signature fields, reading the Document
//! Security Store (DSS) and writing a new one.

use std::ops::Range;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use lopdf::{xref::XrefEntry, Dictionary, Document, Object, ObjectId, Stream};
use regex::bytes::Regex;
use thiserror::Error;

use crate::certificate::Certificate;
use crate::evidence::{EvidenceKind, RevocationEvidence};
use crate::signature::EmbeddedRevocationData;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid signature object")]
    InvalidSignatureObject,
    #[error("file is not signed from the beginning")]
    WrongRangeStart,
    #[error("signature range does not end at the end of a PDF file")]
    WrongRangeEnd,
    #[error("invalid signature range")]
    InvalidRange,
    #[error("signature coverage skips over wrong sections of the document")]
    InvalidCoverage,
    #[error("can not ensure the signature object is where the cross reference says")]
    InternalConsistency,
}

/// A signature field, as found in the document.
///
/// Nothing has been verified yet, apart from the shape of the byte ranges.
#[derive(Debug, Clone)]
pub struct SignatureField {
    /// The field's partial name (`/T`), if any.
    pub name: Option<String>,
    /// The two signed byte ranges. The gap between them holds `/Contents`.
    pub byte_ranges: [Range<usize>; 2],
    /// The signature itself, decoded from the hex string in `/Contents`.
    /// Usually a BER encoded PKCS #7, padded with zeros.
    pub contents: Vec<u8>,
    pub sub_filter: Option<String>,
    /// The signing time written by the signer (`/M`). Untrusted.
    pub claimed_signing_time: Option<DateTime<Utc>>,
    /// Whether the signature covers the document up to its last byte.
    pub covers_whole_document: bool,
}

/// Lists the signature fields of a PDF, in form field order.
///
/// A field that can not be read gives an error in its own slot, and does not
/// prevent reading the others.
pub fn signature_fields(pdf_bytes: &[u8]) -> Result<Vec<Result<SignatureField>>> {
    let doc = Document::load_mem(pdf_bytes)?;
    signature_fields_of(&doc, pdf_bytes)
}

/// Like [`signature_fields`], for an already parsed document.
pub fn signature_fields_of(
    doc: &Document,
    pdf_bytes: &[u8],
) -> Result<Vec<Result<SignatureField>>> {
    let Ok(acro_form) = doc.get_dict_in_dict(doc.catalog()?, b"AcroForm") else {
        log::debug!("document has no interactive form, so no signatures");
        return Ok(Vec::new());
    };

    let mut fields = Vec::new();
    for field in acro_form.get_deref(b"Fields", doc)?.as_array()? {
        let Ok(field) = doc.dereference(field).and_then(|(_, f)| f.as_dict()) else {
            log::warn!("skipping form field {field:?}, which is not a dictionary");
            continue;
        };

        if !is_signature(field) {
            continue;
        }
        // An unsigned signature field has no value yet.
        let Ok(value) = field.get(b"V") else {
            continue;
        };

        let name = field
            .get(b"T")
            .and_then(Object::as_str)
            .ok()
            .map(|t| String::from_utf8_lossy(t).into_owned());
        let signature = process_signature(pdf_bytes, doc, value)
            .map(|signature| SignatureField {
                name: name.clone(),
                ..signature
            })
            .with_context(|| {
                format!("signature field {}", name.as_deref().unwrap_or("<unnamed>"))
            });
        if let Err(err) = &signature {
            log::warn!("{err:#}");
        }
        fields.push(signature);
    }

    Ok(fields)
}

struct ExactArrayOrNone<T, const N: usize>(Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}

fn process_signature(
    pdf_bytes: &[u8],
    doc: &Document,
    sig_reference: &Object,
) -> Result<SignatureField> {
    let (Some(obj_id), Object::Dictionary(signature)) = doc.dereference(sig_reference)? else {
        // Signature object must be an indirect dictionary.
        return Err(Error::InvalidSignatureObject.into());
    };

    let signed_range = signature
        .get_deref(b"ByteRange", doc)?
        .as_array()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_i64()))
        .collect::<lopdf::Result<ExactArrayOrNone<i64, 4>>>()?
        .0
        .ok_or(lopdf::Error::Type)?;

    if signed_range[0] != 0 {
        return Err(Error::WrongRangeStart.into());
    }
    check_object_offset(doc, obj_id, signed_range[1])?;

    for &range in &signed_range[1..] {
        if range < 0 {
            return Err(Error::InvalidRange.into());
        }
    }
    let signed_range_end = signed_range[2]
        .checked_add(signed_range[3])
        .ok_or(Error::InvalidRange)?;
    if signed_range[1] > signed_range[2] || signed_range_end > pdf_bytes.len() as i64 {
        return Err(Error::InvalidRange.into());
    }
    let skipped = signed_range[1] as usize..signed_range[2] as usize;
    let end = signed_range_end as usize;

    // The skipped bytes must be exactly the hex encoded /Contents.
    let contents = decode_pdf_hex_string(&pdf_bytes[skipped.clone()]).ok_or(Error::InvalidCoverage)?;
    if signature.get_deref(b"Contents", doc)?.as_str()? != contents {
        return Err(Error::InvalidCoverage.into());
    }

    if !pdf_ends_with_eof(&pdf_bytes[..end]) {
        return Err(Error::WrongRangeEnd.into());
    }

    let claimed_signing_time = match signature.get(b"M").and_then(Object::as_str) {
        Ok(raw) => {
            let parsed = parse_pdf_date(raw);
            if parsed.is_none() {
                log::warn!(
                    "ignoring unparseable signing time {:?}",
                    String::from_utf8_lossy(raw)
                );
            }
            parsed
        }
        Err(_) => None,
    };

    Ok(SignatureField {
        name: None,
        byte_ranges: [0..skipped.start, skipped.end..end],
        contents,
        sub_filter: signature
            .get(b"SubFilter")
            .and_then(Object::as_name)
            .ok()
            .map(|n| String::from_utf8_lossy(n).into_owned()),
        claimed_signing_time,
        covers_whole_document: end == pdf_bytes.len(),
    })
}

/// The signature dictionary itself must be inside the first signed range.
fn check_object_offset(doc: &Document, obj_id: ObjectId, first_range_end: i64) -> Result<()> {
    match doc
        .reference_table
        .get(obj_id.0)
        .ok_or(Error::InternalConsistency)?
    {
        XrefEntry::Normal { offset, generation } => {
            if *generation != obj_id.1 {
                return Err(Error::InternalConsistency.into());
            }
            if *offset as i64 >= first_range_end {
                return Err(Error::InvalidCoverage.into());
            }
            Ok(())
        }
        _ => Err(Error::InvalidSignatureObject.into()),
    }
}

fn is_signature(field: &Dictionary) -> bool {
    matches!(field.get(b"FT"), Ok(Object::Name(ft)) if ft == b"Sig")
}

/// Decodes a PDF hex string, including the delimiters '<' and '>'.
///
/// Returns None if the string doesn't match the pattern "^<[0-9A-Fa-f]*>$".
fn decode_pdf_hex_string(hex_input: &[u8]) -> Option<Vec<u8>> {
    if hex_input.first() != Some(&b'<') || hex_input.last() != Some(&b'>') {
        return None;
    }
    let hex_input = &hex_input[1..hex_input.len() - 1];

    let mut bytes = Vec::with_capacity(hex_input.len() / 2);
    let mut hex_iter = hex_input.iter().map(|&b| (b as char).to_digit(16));

    while let Some(first) = hex_iter.next() {
        let first = first? as u8;
        // An odd number of digits means a trailing 0.
        let second = hex_iter.next().unwrap_or(Some(0))? as u8;
        bytes.push(first << 4 | second);
    }

    Some(bytes)
}

lazy_static::lazy_static! {
    static ref EOF_REGEX: Regex = Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();

    // D:YYYYMMDDHHmmSSOHH'mm', everything after the year optional.
    static ref DATE_REGEX: Regex = Regex::new(
        r"^D:(\d{4})(\d{2})?(\d{2})?(\d{2})?(\d{2})?(\d{2})?(?:([Zz+\-])(?:(\d{2})'?(?:(\d{2})'?)?)?)?$"
    ).unwrap();
}

/// Tests if the PDF ends with the %%EOF marker.
fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}

/// Parses a PDF date string (ISO 32000-1, 7.9.4). A missing offset means
/// UTC.
pub fn parse_pdf_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let caps = DATE_REGEX.captures(raw)?;
    let number = |i: usize, default: u32| -> Option<u32> {
        match caps.get(i) {
            Some(m) => std::str::from_utf8(m.as_bytes()).ok()?.parse().ok(),
            None => Some(default),
        }
    };

    let date = NaiveDate::from_ymd_opt(number(1, 0)? as i32, number(2, 1)?, number(3, 1)?)?;
    let local = date.and_hms_opt(number(4, 0)?, number(5, 0)?, number(6, 0)?)?;

    let offset = (number(8, 0)? * 3600 + number(9, 0)? * 60) as i32;
    let offset = match caps.get(7).map(|m| m.as_bytes()) {
        Some(b"+") => FixedOffset::east_opt(offset)?,
        Some(b"-") => FixedOffset::west_opt(offset)?,
        _ => FixedOffset::east_opt(0)?,
    };
    offset
        .from_local_datetime(&local)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

fn stream_bytes(stream: &Stream) -> Vec<u8> {
    if stream.dict.has(b"Filter") {
        match stream.decompressed_content() {
            Ok(content) => return content,
            Err(e) => log::warn!("could not decompress DSS stream ({e}), using it as is"),
        }
    }
    stream.content.clone()
}

/// The document's `/DSS` dictionary, if there is one.
fn dss(doc: &Document) -> Result<Option<&Dictionary>> {
    match doc.catalog()?.get_deref(b"DSS", doc) {
        Ok(dss) => Ok(Some(dss.as_dict()?)),
        Err(_) => Ok(None),
    }
}

/// The streams listed under `key` in the DSS: (reference, decoded bytes).
fn dss_streams(doc: &Document, dss: &Dictionary, key: &[u8]) -> Result<Vec<(Object, Vec<u8>)>> {
    let Ok(array) = dss.get_deref(key, doc) else {
        return Ok(Vec::new());
    };
    array
        .as_array()?
        .iter()
        .map(|item| {
            let (_, object) = doc.dereference(item)?;
            Ok((item.clone(), stream_bytes(object.as_stream()?)))
        })
        .collect()
}

/// Revocation data previously embedded in the document's DSS.
pub fn embedded_revocation_data(doc: &Document) -> Result<EmbeddedRevocationData> {
    let Some(dss) = dss(doc)? else {
        return Ok(EmbeddedRevocationData::default());
    };
    let bytes = |key: &[u8]| -> Result<Vec<Vec<u8>>> {
        Ok(dss_streams(doc, dss, key)?
            .into_iter()
            .map(|(_, content)| content)
            .collect())
    };
    Ok(EmbeddedRevocationData {
        crls: bytes(b"CRLs")?,
        ocsp_responses: bytes(b"OCSPs")?,
    })
}

/// Certificates previously embedded in the document's DSS. Entries that do
/// not parse are skipped.
pub fn dss_certificates(doc: &Document) -> Result<Vec<Certificate>> {
    let Some(dss) = dss(doc)? else {
        return Ok(Vec::new());
    };
    Ok(dss_streams(doc, dss, b"Certs")?
        .into_iter()
        .filter_map(|(_, der)| match Certificate::from_der(&der) {
            Ok(cert) => Some(cert),
            Err(e) => {
                log::warn!("skipping DSS certificate: {e}");
                None
            }
        })
        .collect())
}

/// One DSS array being extended, remembering what it already holds.
struct DssArray {
    refs: Vec<Object>,
    contents: Vec<Vec<u8>>,
}

impl DssArray {
    fn read(doc: &Document, dss: Option<&Dictionary>, key: &[u8]) -> Result<Self> {
        let existing = match dss {
            Some(dss) => dss_streams(doc, dss, key)?,
            None => Vec::new(),
        };
        let (refs, contents) = existing.into_iter().unzip();
        Ok(DssArray { refs, contents })
    }

    fn push(&mut self, doc: &mut Document, bytes: &[u8]) -> bool {
        if self.contents.iter().any(|known| known == bytes) {
            return false;
        }
        let id = doc.add_object(Stream::new(Dictionary::new(), bytes.to_vec()));
        self.refs.push(Object::Reference(id));
        self.contents.push(bytes.to_vec());
        true
    }
}

/// Adds `certificates` and `evidence` to the document's DSS, creating it if
/// needed. Items already in the DSS are not added twice.
///
/// Only the object graph of `doc` changes. Saving it, normally as an
/// incremental update, is up to the caller.
pub fn embed_dss(
    doc: &mut Document,
    certificates: &[Arc<Certificate>],
    evidence: &[RevocationEvidence],
) -> Result<()> {
    let existing = dss(doc)?.cloned();
    let mut certs = DssArray::read(doc, existing.as_ref(), b"Certs")?;
    let mut crls = DssArray::read(doc, existing.as_ref(), b"CRLs")?;
    let mut ocsps = DssArray::read(doc, existing.as_ref(), b"OCSPs")?;

    let mut added = 0;
    for cert in certificates {
        added += usize::from(certs.push(doc, cert.der()));
    }
    for item in evidence {
        let target = match item.kind {
            EvidenceKind::Crl => &mut crls,
            EvidenceKind::Ocsp => &mut ocsps,
        };
        added += usize::from(target.push(doc, &item.der));
    }

    let mut dss = existing.unwrap_or_else(Dictionary::new);
    dss.set("Certs", Object::Array(certs.refs));
    dss.set("CRLs", Object::Array(crls.refs));
    dss.set("OCSPs", Object::Array(ocsps.refs));
    let dss_id = doc.add_object(dss);

    let root = doc.trailer.get(b"Root")?.as_reference()?;
    doc.get_object_mut(root)?
        .as_dict_mut()?
        .set("DSS", Object::Reference(dss_id));
    log::debug!("DSS now references {added} new streams");

    Ok(())
}

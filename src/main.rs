use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use trust_ltv::{
    openssl::{load_trust_anchors_from_dir, signature_record, OpenSslProvider},
    pdf, Fetcher, NoFetch, ValidationConfig, ValidationSession,
};

const USAGE: &str = "usage: trust_ltv <signed.pdf> <trust-anchors-dir> [--date <RFC 3339>] [--offline] [--ltv]";

struct Args {
    pdf: PathBuf,
    anchors: PathBuf,
    date: DateTime<Utc>,
    offline: bool,
    ltv: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut positional = Vec::new();
        let mut date = Utc::now();
        let mut offline = false;
        let mut ltv = false;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--date" => {
                    let value = args.next().context("--date needs a value")?;
                    date = DateTime::parse_from_rfc3339(&value)
                        .with_context(|| format!("invalid date {value:?}"))?
                        .with_timezone(&Utc);
                }
                "--offline" => offline = true,
                "--ltv" => ltv = true,
                "-h" | "--help" => {
                    println!("{USAGE}");
                    std::process::exit(0);
                }
                _ if arg.starts_with("--") => bail!("unknown option {arg}\n{USAGE}"),
                _ => positional.push(PathBuf::from(arg)),
            }
        }

        let [pdf, anchors]: [PathBuf; 2] = positional
            .try_into()
            .map_err(|_| anyhow::anyhow!(USAGE))?;
        Ok(Args {
            pdf,
            anchors,
            date,
            offline,
            ltv,
        })
    }
}

fn fetcher(offline: bool) -> Result<Box<dyn Fetcher>> {
    if offline {
        return Ok(Box::new(NoFetch));
    }
    #[cfg(feature = "http")]
    return Ok(Box::new(trust_ltv::HttpFetcher::new()?));
    #[cfg(not(feature = "http"))]
    {
        log::warn!("built without the http feature, validating offline");
        Ok(Box::new(NoFetch))
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse()?;

    let pdf_bytes = std::fs::read(&args.pdf)
        .with_context(|| format!("reading {}", args.pdf.display()))?;
    let doc = lopdf::Document::load_mem(&pdf_bytes)?;
    let anchors = load_trust_anchors_from_dir(&args.anchors)?;

    let fields = pdf::signature_fields_of(&doc, &pdf_bytes)?;
    if fields.is_empty() {
        println!("{}: no signatures", args.pdf.display());
        return Ok(());
    }
    let dss = pdf::embedded_revocation_data(&doc)?;
    let dss_certificates = pdf::dss_certificates(&doc)?;

    let fetcher = fetcher(args.offline)?;
    let config = ValidationConfig::default().with_fetch(!args.offline);
    let session = ValidationSession::new(OpenSslProvider, &*fetcher, config);

    for field in &fields {
        let field = match field {
            Ok(field) => field,
            Err(err) => {
                println!("{err:#}");
                continue;
            }
        };
        let name = field.name.as_deref().unwrap_or("<unnamed>");
        let mut record = match signature_record(&pdf_bytes, field, &dss) {
            Ok(record) => record,
            Err(err) => {
                println!("{name}: unreadable signature: {err:#}");
                continue;
            }
        };
        record.certificates.extend(dss_certificates.iter().cloned());

        let verdict = match session.validate(&record, &anchors, args.date) {
            Ok(verdict) => verdict,
            Err(err) => {
                println!("{name}: not validated: {err}");
                continue;
            }
        };
        println!("{name}: {} ({})", verdict.status, verdict.reason);
        if !field.covers_whole_document {
            println!("{name}: the document was changed after this signature");
        }
        for cert in &verdict.certificates {
            println!("    {}: {:?}, {}", cert.subject, cert.status.state, cert.status.detail);
        }

        if args.ltv {
            if let Some(chain) = verdict.chain() {
                let evidence = session.collect_ltv_evidence(chain, args.date)?;
                println!("    LTV evidence to embed: {} items", evidence.len());
                for item in &evidence {
                    println!(
                        "      {} covering {} certificate(s), produced {}",
                        item.kind,
                        item.covers.len(),
                        item.this_update
                    );
                }
            }
        }
    }

    Ok(())
}

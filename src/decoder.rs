//! Report Decoder Module
//!
//! This module decodes aggregate-report XML into the canonical [`Report`] model.
//! Decoding is driven purely by element names: every known element has a slot in
//! the model and anything else is skipped, so vendor extensions need no special
//! casing. Element prefixes are ignored, which covers generators that qualify the
//! schema namespace.
//!
//! DOCTYPE declarations are never processed. A DOCTYPE block is removed before
//! parsing, and a block that defines two or more entities is rejected outright
//! (Billion Laughs).

use crate::error::{DmarcError, Result};
use crate::models::{
    DkimResult, DkimVerdict, PolicyEvaluated, PolicyOverrideReason, PolicyType, PublishedPolicy,
    Record, Report, ReportMetadata, SpfResult, SpfVerdict,
};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::borrow::Cow;
use std::net::IpAddr;
use std::str::FromStr;

type XmlReader<'a> = Reader<&'a [u8]>;

/// Decodes XML bytes into a [`Report`]. Performs no I/O and no policy evaluation.
///
/// # Errors
///
/// - `Validation` naming the field when `report_id`, `domain`, a record's
///   `source_ip`/`count`, or every record is missing, or the date range is inverted.
/// - `MalformedField` when a numeric field, timestamp or IP address does not
///   parse, or the document itself is not well-formed XML.
pub fn decode(xml: &[u8]) -> Result<Report> {
    let text = std::str::from_utf8(xml)
        .map_err(|e| DmarcError::malformed("document", format!("not valid UTF-8: {}", e)))?;
    let text = text.trim_start_matches('\u{feff}');
    let cleaned = strip_doctype(text)?;

    let mut reader = Reader::from_str(&cleaned);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"feedback" {
                    return parse_feedback(&mut reader);
                }
                return Err(DmarcError::Validation("feedback root element".into()));
            }
            Event::Empty(_) | Event::Eof => {
                return Err(DmarcError::Validation("feedback root element".into()));
            }
            _ => {}
        }
    }
}

/// Removes a DOCTYPE block, refusing blocks with two or more entity definitions.
fn strip_doctype(xml: &str) -> Result<Cow<'_, str>> {
    let Some(start) = xml.find("<!DOCTYPE") else {
        return Ok(Cow::Borrowed(xml));
    };
    let rest = &xml[start..];
    let unterminated = || DmarcError::malformed("document", "unterminated DOCTYPE");
    let first_close = rest.find('>').ok_or_else(unterminated)?;
    // Only an internal subset (`[ ... ]`) can contain `>` before the declaration ends.
    let end = match rest[..first_close].find('[') {
        Some(_) => rest.find("]>").ok_or_else(unterminated)? + 2,
        None => first_close + 1,
    };
    let doctype = &rest[..end];
    if doctype.matches("<!ENTITY").count() >= 2 {
        return Err(DmarcError::malformed("document", "recursive entities detected"));
    }
    Ok(Cow::Owned(format!("{}{}", &xml[..start], &rest[end..])))
}

fn parse_feedback(reader: &mut XmlReader<'_>) -> Result<Report> {
    let mut version = None;
    let mut metadata = None;
    let mut policy = None;
    let mut records = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"version" => version = Some(read_value(reader, &e)?).filter(|v| !v.is_empty()),
                b"report_metadata" => metadata = Some(parse_metadata(reader)?),
                b"policy_published" => policy = Some(parse_policy_published(reader)?),
                b"record" => records.push(parse_record(reader)?),
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("feedback")),
            _ => {}
        }
    }

    let metadata = metadata.ok_or_else(|| DmarcError::Validation("report_id".into()))?;
    let policy = policy.ok_or_else(|| DmarcError::Validation("domain".into()))?;
    if metadata.report_id.is_empty() {
        return Err(DmarcError::Validation("report_id".into()));
    }
    if policy.domain.is_empty() {
        return Err(DmarcError::Validation("domain".into()));
    }
    if records.is_empty() {
        return Err(DmarcError::Validation("record".into()));
    }
    if metadata.date_begin > metadata.date_end {
        return Err(DmarcError::malformed(
            "date_range",
            format!("begin {} is after end {}", metadata.date_begin, metadata.date_end),
        ));
    }

    Ok(Report {
        version,
        metadata,
        policy,
        records,
    })
}

/// Parses the `<report_metadata>` element.
fn parse_metadata(reader: &mut XmlReader<'_>) -> Result<ReportMetadata> {
    let mut metadata = ReportMetadata {
        org_name: String::new(),
        email: String::new(),
        extra_contact_info: None,
        report_id: String::new(),
        date_begin: DateTime::<Utc>::UNIX_EPOCH,
        date_end: DateTime::<Utc>::UNIX_EPOCH,
        errors: Vec::new(),
    };
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"org_name" => metadata.org_name = read_value(reader, &e)?,
                b"email" => metadata.email = read_value(reader, &e)?,
                b"extra_contact_info" => metadata.extra_contact_info = read_optional(reader, &e)?,
                b"report_id" => metadata.report_id = read_value(reader, &e)?,
                b"error" => metadata.errors.push(read_value(reader, &e)?),
                b"date_range" => {
                    let (begin, end) = parse_date_range(reader)?;
                    metadata.date_begin = begin;
                    metadata.date_end = end.unwrap_or(begin);
                }
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("report_metadata")),
            _ => {}
        }
    }
    Ok(metadata)
}

fn parse_date_range(reader: &mut XmlReader<'_>) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>)> {
    let mut begin = DateTime::<Utc>::UNIX_EPOCH;
    let mut end = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"begin" => begin = parse_timestamp("date_range.begin", &read_value(reader, &e)?)?,
                b"end" => end = Some(parse_timestamp("date_range.end", &read_value(reader, &e)?)?),
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("date_range")),
            _ => {}
        }
    }
    Ok((begin, end))
}

/// Parses the `<policy_published>` element.
fn parse_policy_published(reader: &mut XmlReader<'_>) -> Result<PublishedPolicy> {
    let mut policy = PublishedPolicy {
        domain: String::new(),
        adkim: None,
        aspf: None,
        policy: PolicyType::None,
        subdomain_policy: None,
        pct: 100,
        fo: None,
    };
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"domain" => policy.domain = read_value(reader, &e)?,
                b"adkim" => policy.adkim = read_value(reader, &e)?.parse().ok(),
                b"aspf" => policy.aspf = read_value(reader, &e)?.parse().ok(),
                b"p" => policy.policy = read_value(reader, &e)?.parse().unwrap_or_default(),
                b"sp" => policy.subdomain_policy = read_value(reader, &e)?.parse().ok(),
                b"fo" => policy.fo = read_optional(reader, &e)?,
                b"pct" => {
                    let text = read_value(reader, &e)?;
                    if !text.is_empty() {
                        policy.pct = parse_number::<u8>("pct", &text)?;
                        if policy.pct > 100 {
                            return Err(DmarcError::malformed("pct", format!("{} is above 100", text)));
                        }
                    }
                }
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("policy_published")),
            _ => {}
        }
    }
    Ok(policy)
}

/// Parses one `<record>` element.
fn parse_record(reader: &mut XmlReader<'_>) -> Result<Record> {
    let mut source_ip = None;
    let mut count = None;
    let mut policy_evaluated = PolicyEvaluated::default();
    let mut header_from = String::new();
    let mut envelope_from = None;
    let mut envelope_to = None;
    let mut dkim = Vec::new();
    let mut spf = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => loop {
                    match reader.read_event()? {
                        Event::Start(e) => match e.local_name().as_ref() {
                            b"source_ip" => {
                                let text = read_value(reader, &e)?;
                                source_ip = Some(IpAddr::from_str(&text).map_err(|err| {
                                    DmarcError::malformed("source_ip", format!("{:?}: {}", text, err))
                                })?);
                            }
                            b"count" => {
                                let value = parse_number::<u32>("count", &read_value(reader, &e)?)?;
                                if value == 0 {
                                    return Err(DmarcError::malformed("count", "must be positive"));
                                }
                                count = Some(value);
                            }
                            b"policy_evaluated" => policy_evaluated = parse_policy_evaluated(reader)?,
                            _ => skip(reader, &e)?,
                        },
                        Event::End(_) => break,
                        Event::Eof => return Err(truncated("row")),
                        _ => {}
                    }
                },
                b"identifiers" => loop {
                    match reader.read_event()? {
                        Event::Start(e) => match e.local_name().as_ref() {
                            b"header_from" => header_from = read_value(reader, &e)?,
                            b"envelope_from" => envelope_from = read_optional(reader, &e)?,
                            b"envelope_to" => envelope_to = read_optional(reader, &e)?,
                            _ => skip(reader, &e)?,
                        },
                        Event::End(_) => break,
                        Event::Eof => return Err(truncated("identifiers")),
                        _ => {}
                    }
                },
                b"auth_results" => loop {
                    match reader.read_event()? {
                        Event::Start(e) => match e.local_name().as_ref() {
                            b"dkim" => dkim.push(parse_dkim(reader)?),
                            b"spf" => spf.push(parse_spf(reader)?),
                            _ => skip(reader, &e)?,
                        },
                        Event::End(_) => break,
                        Event::Eof => return Err(truncated("auth_results")),
                        _ => {}
                    }
                },
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("record")),
            _ => {}
        }
    }

    Ok(Record {
        source_ip: source_ip.ok_or_else(|| DmarcError::Validation("record.row.source_ip".into()))?,
        count: count.ok_or_else(|| DmarcError::Validation("record.row.count".into()))?,
        policy_evaluated,
        header_from,
        envelope_from,
        envelope_to,
        dkim,
        spf,
        compliance: None,
    })
}

/// Parses the `<policy_evaluated>` element of a row.
fn parse_policy_evaluated(reader: &mut XmlReader<'_>) -> Result<PolicyEvaluated> {
    let mut evaluated = PolicyEvaluated::default();
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"disposition" => evaluated.disposition = read_value(reader, &e)?,
                b"dkim" => evaluated.dkim = dkim_verdict(&read_value(reader, &e)?),
                b"spf" => evaluated.spf = spf_verdict(&read_value(reader, &e)?),
                b"reason" => evaluated.reasons.push(parse_reason(reader)?),
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("policy_evaluated")),
            _ => {}
        }
    }
    Ok(evaluated)
}

fn parse_reason(reader: &mut XmlReader<'_>) -> Result<PolicyOverrideReason> {
    let mut reason = PolicyOverrideReason {
        kind: String::new(),
        comment: None,
    };
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"type" => reason.kind = read_value(reader, &e)?,
                b"comment" => reason.comment = read_optional(reader, &e)?,
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("reason")),
            _ => {}
        }
    }
    Ok(reason)
}

/// Parses the `<dkim>` element of `<auth_results>`.
fn parse_dkim(reader: &mut XmlReader<'_>) -> Result<DkimResult> {
    let mut result = DkimResult {
        domain: String::new(),
        selector: String::new(),
        result: DkimVerdict::None,
        raw_result: String::new(),
        human_result: None,
    };
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"domain" => result.domain = read_value(reader, &e)?,
                b"selector" => result.selector = read_value(reader, &e)?,
                b"result" => {
                    result.raw_result = read_value(reader, &e)?.to_ascii_lowercase();
                    result.result = dkim_verdict(&result.raw_result);
                }
                b"human_result" => result.human_result = read_optional(reader, &e)?,
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("dkim")),
            _ => {}
        }
    }
    Ok(result)
}

/// Parses the `<spf>` element of `<auth_results>`.
fn parse_spf(reader: &mut XmlReader<'_>) -> Result<SpfResult> {
    let mut result = SpfResult {
        domain: String::new(),
        scope: None,
        result: SpfVerdict::None,
        raw_result: String::new(),
    };
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"domain" => result.domain = read_value(reader, &e)?,
                b"scope" => result.scope = read_optional(reader, &e)?,
                b"result" => {
                    result.raw_result = read_value(reader, &e)?.to_ascii_lowercase();
                    result.result = spf_verdict(&result.raw_result);
                }
                _ => skip(reader, &e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(truncated("spf")),
            _ => {}
        }
    }
    Ok(result)
}

/// Reads the text content of `start` up to its end tag, trimmed and unescaped.
/// CDATA sections contribute their contents verbatim.
fn read_value(reader: &mut XmlReader<'_>, start: &BytesStart<'_>) -> Result<String> {
    let mut value = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(text) => value.push_str(&text.unescape()?),
            Event::CData(cdata) => {
                let inner = cdata.into_inner();
                let text = std::str::from_utf8(&inner)
                    .map_err(|e| DmarcError::malformed("document", format!("not valid UTF-8: {}", e)))?;
                value.push_str(text);
            }
            Event::Start(e) => skip(reader, &e)?,
            Event::End(_) => break,
            Event::Eof => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                return Err(truncated(&name));
            }
            _ => {}
        }
    }
    Ok(value.trim().to_string())
}

fn read_optional(reader: &mut XmlReader<'_>, start: &BytesStart<'_>) -> Result<Option<String>> {
    Ok(Some(read_value(reader, start)?).filter(|v| !v.is_empty()))
}

fn skip(reader: &mut XmlReader<'_>, start: &BytesStart<'_>) -> Result<()> {
    reader.read_to_end(start.name())?;
    Ok(())
}

fn truncated(element: &str) -> DmarcError {
    DmarcError::malformed(element, "unexpected end of document")
}

fn parse_number<T: FromStr>(field: &str, text: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    text.parse::<T>()
        .map_err(|e| DmarcError::malformed(field, format!("{:?}: {}", text, e)))
}

/// Timestamps are POSIX seconds in UTC.
fn parse_timestamp(field: &str, text: &str) -> Result<DateTime<Utc>> {
    let secs = parse_number::<i64>(field, text)?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DmarcError::malformed(field, format!("{} is out of range", secs)))
}

fn dkim_verdict(text: &str) -> DkimVerdict {
    text.parse().unwrap_or_else(|e| {
        log::debug!("{}; treating as none", e);
        DkimVerdict::None
    })
}

fn spf_verdict(text: &str) -> SpfVerdict {
    text.parse().unwrap_or_else(|e| {
        log::debug!("{}; treating as none", e);
        SpfVerdict::None
    })
}

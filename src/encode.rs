//! Renders a [`Report`] back into aggregate-report XML.
//!
//! The output follows the element layout the decoder reads, so
//! `decode(to_xml(r).as_bytes())` reproduces `r` minus compliance annotations.

use crate::models::Report;
use quick_xml::escape::escape;
use std::fmt::Write;

pub fn to_xml(report: &Report) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<feedback>\n");
    if let Some(version) = &report.version {
        element(&mut out, 1, "version", version);
    }

    let meta = &report.metadata;
    open(&mut out, 1, "report_metadata");
    element(&mut out, 2, "org_name", &meta.org_name);
    element(&mut out, 2, "email", &meta.email);
    optional(&mut out, 2, "extra_contact_info", meta.extra_contact_info.as_deref());
    element(&mut out, 2, "report_id", &meta.report_id);
    open(&mut out, 2, "date_range");
    element(&mut out, 3, "begin", &meta.date_begin.timestamp().to_string());
    element(&mut out, 3, "end", &meta.date_end.timestamp().to_string());
    close(&mut out, 2, "date_range");
    for error in &meta.errors {
        element(&mut out, 2, "error", error);
    }
    close(&mut out, 1, "report_metadata");

    let policy = &report.policy;
    open(&mut out, 1, "policy_published");
    element(&mut out, 2, "domain", &policy.domain);
    optional(&mut out, 2, "adkim", policy.adkim.as_ref().map(|m| m.as_tag()));
    optional(&mut out, 2, "aspf", policy.aspf.as_ref().map(|m| m.as_tag()));
    element(&mut out, 2, "p", &policy.policy.to_string());
    optional(&mut out, 2, "sp", policy.subdomain_policy.as_ref().map(|p| p.to_string()).as_deref());
    element(&mut out, 2, "pct", &policy.pct.to_string());
    optional(&mut out, 2, "fo", policy.fo.as_deref());
    close(&mut out, 1, "policy_published");

    for record in &report.records {
        open(&mut out, 1, "record");
        open(&mut out, 2, "row");
        element(&mut out, 3, "source_ip", &record.source_ip.to_string());
        element(&mut out, 3, "count", &record.count.to_string());
        let evaluated = &record.policy_evaluated;
        open(&mut out, 3, "policy_evaluated");
        element(&mut out, 4, "disposition", &evaluated.disposition);
        element(&mut out, 4, "dkim", &evaluated.dkim.to_string());
        element(&mut out, 4, "spf", &evaluated.spf.to_string());
        for reason in &evaluated.reasons {
            open(&mut out, 4, "reason");
            element(&mut out, 5, "type", &reason.kind);
            optional(&mut out, 5, "comment", reason.comment.as_deref());
            close(&mut out, 4, "reason");
        }
        close(&mut out, 3, "policy_evaluated");
        close(&mut out, 2, "row");

        open(&mut out, 2, "identifiers");
        optional(&mut out, 3, "envelope_to", record.envelope_to.as_deref());
        optional(&mut out, 3, "envelope_from", record.envelope_from.as_deref());
        element(&mut out, 3, "header_from", &record.header_from);
        close(&mut out, 2, "identifiers");

        open(&mut out, 2, "auth_results");
        for dkim in &record.dkim {
            open(&mut out, 3, "dkim");
            element(&mut out, 4, "domain", &dkim.domain);
            element(&mut out, 4, "selector", &dkim.selector);
            element(&mut out, 4, "result", &result_text(&dkim.raw_result, &dkim.result));
            optional(&mut out, 4, "human_result", dkim.human_result.as_deref());
            close(&mut out, 3, "dkim");
        }
        for spf in &record.spf {
            open(&mut out, 3, "spf");
            element(&mut out, 4, "domain", &spf.domain);
            optional(&mut out, 4, "scope", spf.scope.as_deref());
            element(&mut out, 4, "result", &result_text(&spf.raw_result, &spf.result));
            close(&mut out, 3, "spf");
        }
        close(&mut out, 2, "auth_results");
        close(&mut out, 1, "record");
    }
    out.push_str("</feedback>\n");
    out
}

/// The result as reported, or the verdict when the report was built in code.
fn result_text(raw: &str, verdict: &impl std::fmt::Display) -> String {
    if raw.is_empty() {
        verdict.to_string()
    } else {
        raw.to_string()
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn open(out: &mut String, depth: usize, name: &str) {
    indent(out, depth);
    let _ = writeln!(out, "<{}>", name);
}

fn close(out: &mut String, depth: usize, name: &str) {
    indent(out, depth);
    let _ = writeln!(out, "</{}>", name);
}

fn element(out: &mut String, depth: usize, name: &str, value: &str) {
    indent(out, depth);
    let _ = writeln!(out, "<{0}>{1}</{0}>", name, escape(value));
}

fn optional(out: &mut String, depth: usize, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        element(out, depth, name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::models::{
        AlignmentMode, DkimResult, DkimVerdict, PolicyEvaluated, PolicyOverrideReason, PolicyType,
        PublishedPolicy, Record, ReportMetadata, SpfResult, SpfVerdict,
    };
    use chrono::DateTime;

    fn sample() -> Report {
        Report {
            version: Some("1.0".into()),
            metadata: ReportMetadata {
                org_name: "Mail <&> Co".into(),
                email: "dmarc@mail.example".into(),
                extra_contact_info: None,
                report_id: "abc-1".into(),
                date_begin: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                date_end: DateTime::from_timestamp(1_700_086_399, 0).unwrap(),
                errors: vec!["partial data".into()],
            },
            policy: PublishedPolicy {
                domain: "example.org".into(),
                adkim: Some(AlignmentMode::Strict),
                aspf: None,
                policy: PolicyType::Reject,
                subdomain_policy: Some(PolicyType::Quarantine),
                pct: 100,
                fo: Some("1".into()),
            },
            records: vec![Record {
                source_ip: "2001:db8::1".parse().unwrap(),
                count: 7,
                policy_evaluated: PolicyEvaluated {
                    disposition: "reject".into(),
                    dkim: DkimVerdict::Fail,
                    spf: SpfVerdict::Fail,
                    reasons: vec![PolicyOverrideReason {
                        kind: "local_policy".into(),
                        comment: None,
                    }],
                },
                header_from: "example.org".into(),
                envelope_from: Some("example.org".into()),
                envelope_to: None,
                dkim: vec![DkimResult {
                    domain: "example.org".into(),
                    selector: "k1".into(),
                    result: DkimVerdict::PermError,
                    raw_result: "permerror".into(),
                    human_result: Some("bad key".into()),
                }],
                spf: vec![SpfResult {
                    domain: "example.org".into(),
                    scope: Some("mfrom".into()),
                    result: SpfVerdict::SoftFail,
                    raw_result: "softfail".into(),
                }],
                compliance: None,
            }],
        }
    }

    #[test]
    fn test_output_decodes_to_same_report() {
        let report = sample();
        let xml = to_xml(&report);
        assert!(xml.contains("Mail &lt;&amp;&gt; Co"));
        assert_eq!(decode(xml.as_bytes()).unwrap(), report);
    }
}

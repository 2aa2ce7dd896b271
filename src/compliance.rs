//! Compliance Evaluator Module
//!
//! DMARC passes for a record when SPF or DKIM passes *and* the authenticated
//! domain aligns with the header-from domain. Strict alignment requires an exact
//! (case-insensitive) match; relaxed alignment requires the two domains to share
//! an organizational domain, looked up in the Public Suffix List.
//!
//! The aggregate figures on [`Report`] are recomputed from the records on every
//! call, never read back from the per-record annotation.

use crate::models::{AlignmentMode, Compliance, DkimVerdict, PublishedPolicy, Record, Report, SpfVerdict};

/// Annotates every record of `report` with its [`Compliance`]. Idempotent.
pub fn evaluate(mut report: Report) -> Report {
    for record in &mut report.records {
        record.compliance = Some(assess(record, &report.policy));
    }
    report
}

/// Runs the alignment algorithm for one record under `policy`'s alignment modes.
pub fn assess(record: &Record, policy: &PublishedPolicy) -> Compliance {
    let header_from = if record.header_from.trim().is_empty() {
        policy.domain.as_str()
    } else {
        record.header_from.as_str()
    };

    let spf_mode = policy.spf_alignment();
    // HELO identities never take part in DMARC alignment.
    let spf_aligned = record
        .spf
        .iter()
        .filter(|s| s.scope.as_deref().map_or(true, |scope| scope.eq_ignore_ascii_case("mfrom")))
        .any(|s| s.result == SpfVerdict::Pass && aligned(&s.domain, header_from, &spf_mode));

    let dkim_mode = policy.dkim_alignment();
    let dkim_aligned = record
        .dkim
        .iter()
        .any(|d| d.result == DkimVerdict::Pass && aligned(&d.domain, header_from, &dkim_mode));

    Compliance {
        spf_aligned,
        dkim_aligned,
        compliant: spf_aligned || dkim_aligned,
    }
}

/// Whether `auth_domain` aligns with `header_from` under `mode`.
pub fn aligned(auth_domain: &str, header_from: &str, mode: &AlignmentMode) -> bool {
    let auth = normalize(auth_domain);
    let from = normalize(header_from);
    if auth.is_empty() || from.is_empty() {
        return false;
    }
    match mode {
        AlignmentMode::Strict => auth == from,
        AlignmentMode::Relaxed => auth == from || organizational_domain(&auth) == organizational_domain(&from),
    }
}

/// Lowercase and strip a trailing dot.
fn normalize(domain: &str) -> String {
    let d = domain.trim().to_ascii_lowercase();
    d.strip_suffix('.').unwrap_or(&d).to_string()
}

/// The registrable domain (public suffix plus one label), or the input itself.
pub fn organizational_domain(domain: &str) -> String {
    let normalized = normalize(domain);
    match psl::domain_str(&normalized) {
        Some(org) => org.to_string(),
        None => normalized,
    }
}

/// `compliant / total * 100`, or 0 when there are no messages.
pub fn compliance_rate(compliant: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        compliant as f64 / total as f64 * 100.0
    }
}

impl Report {
    /// Sum of record counts.
    pub fn total_messages(&self) -> u64 {
        self.records.iter().map(|r| u64::from(r.count)).sum()
    }

    /// Sum of counts over records that pass DMARC.
    pub fn compliant_count(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| assess(r, &self.policy).compliant)
            .map(|r| u64::from(r.count))
            .sum()
    }

    pub fn compliance_rate(&self) -> f64 {
        compliance_rate(self.compliant_count(), self.total_messages())
    }
}

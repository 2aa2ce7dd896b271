//! Data Models Module
//!
//! This module defines the canonical report model every vendor dialect is decoded
//! into, together with the result structures returned by the query surface. It
//! also provides string conversions for the verdict and policy enums.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A decoded aggregate report. `(metadata.org_name, metadata.report_id)` is its natural key.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Report {
    pub version: Option<String>,
    pub metadata: ReportMetadata,
    pub policy: PublishedPolicy,
    pub records: Vec<Record>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReportMetadata {
    pub org_name: String,
    pub email: String,
    pub extra_contact_info: Option<String>,
    pub report_id: String,
    pub date_begin: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PublishedPolicy {
    pub domain: String,
    pub adkim: Option<AlignmentMode>,
    pub aspf: Option<AlignmentMode>,
    pub policy: PolicyType,
    pub subdomain_policy: Option<PolicyType>,
    pub pct: u8,
    pub fo: Option<String>,
}

impl PublishedPolicy {
    /// DKIM alignment mode in force; an absent `adkim` means relaxed.
    pub fn dkim_alignment(&self) -> AlignmentMode {
        self.adkim.clone().unwrap_or_default()
    }

    /// SPF alignment mode in force; an absent `aspf` means relaxed.
    pub fn spf_alignment(&self) -> AlignmentMode {
        self.aspf.clone().unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Record {
    pub source_ip: IpAddr,
    pub count: u32,
    pub policy_evaluated: PolicyEvaluated,
    pub header_from: String,
    pub envelope_from: Option<String>,
    pub envelope_to: Option<String>,
    pub dkim: Vec<DkimResult>,
    pub spf: Vec<SpfResult>,
    /// Filled in by the compliance evaluator; `None` straight out of the decoder.
    pub compliance: Option<Compliance>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PolicyEvaluated {
    pub disposition: String,
    pub dkim: DkimVerdict,
    pub spf: SpfVerdict,
    pub reasons: Vec<PolicyOverrideReason>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PolicyOverrideReason {
    pub kind: String,
    pub comment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DkimResult {
    pub domain: String,
    pub selector: String,
    pub result: DkimVerdict,
    /// Result exactly as reported (trimmed, lowercased), including values outside the schema.
    #[serde(default)]
    pub raw_result: String,
    pub human_result: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SpfResult {
    pub domain: String,
    pub scope: Option<String>,
    pub result: SpfVerdict,
    #[serde(default)]
    pub raw_result: String,
}

/// Per-record outcome of the alignment algorithm.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Compliance {
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    pub compliant: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub enum DkimVerdict {
    #[default]
    None,
    Pass,
    Fail,
    Policy,
    Neutral,
    TempError,
    PermError,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub enum SpfVerdict {
    #[default]
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

impl AlignmentMode {
    /// Single-letter form used by the aggregate report schema.
    pub fn as_tag(&self) -> &'static str {
        match self {
            AlignmentMode::Relaxed => "r",
            AlignmentMode::Strict => "s",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub enum PolicyType {
    #[default]
    None,
    Quarantine,
    Reject,
}

/// Outcome of persisting a report. A repeated `(org_name, report_id)` is `Skipped`, not an error.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted(i64),
    Skipped,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Statistics {
    pub total_reports: i64,
    pub total_messages: i64,
    pub compliance_rate: f64,
    pub unique_source_ips: i64,
    pub unique_domains: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReportSummary {
    pub id: i64,
    pub org_name: String,
    pub domain: String,
    pub period_begin: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_messages: i64,
    pub compliance_rate: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TopSourceIp {
    pub ip: String,
    pub total_count: i64,
    pub pass_count: i64,
    pub fail_count: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DomainStats {
    pub domain: String,
    pub total_messages: i64,
    pub compliant_messages: i64,
    pub compliance_rate: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OrgStats {
    pub org_name: String,
    pub report_count: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthResultStats {
    pub result: String,
    pub count: i64,
}

impl fmt::Display for DkimVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkimVerdict::None => write!(f, "none"),
            DkimVerdict::Pass => write!(f, "pass"),
            DkimVerdict::Fail => write!(f, "fail"),
            DkimVerdict::Policy => write!(f, "policy"),
            DkimVerdict::Neutral => write!(f, "neutral"),
            DkimVerdict::TempError => write!(f, "temperror"),
            DkimVerdict::PermError => write!(f, "permerror"),
        }
    }
}
impl fmt::Display for SpfVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpfVerdict::None => write!(f, "none"),
            SpfVerdict::Neutral => write!(f, "neutral"),
            SpfVerdict::Pass => write!(f, "pass"),
            SpfVerdict::Fail => write!(f, "fail"),
            SpfVerdict::SoftFail => write!(f, "softfail"),
            SpfVerdict::TempError => write!(f, "temperror"),
            SpfVerdict::PermError => write!(f, "permerror"),
        }
    }
}
impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentMode::Relaxed => write!(f, "relaxed"),
            AlignmentMode::Strict => write!(f, "strict"),
        }
    }
}
impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::None => write!(f, "none"),
            PolicyType::Quarantine => write!(f, "quarantine"),
            PolicyType::Reject => write!(f, "reject"),
        }
    }
}
impl FromStr for DkimVerdict {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pass" => Ok(DkimVerdict::Pass),
            "fail" => Ok(DkimVerdict::Fail),
            "policy" => Ok(DkimVerdict::Policy),
            "neutral" => Ok(DkimVerdict::Neutral),
            "temperror" => Ok(DkimVerdict::TempError),
            "permerror" => Ok(DkimVerdict::PermError),
            "none" => Ok(DkimVerdict::None),
            _ => Err(format!("Invalid DKIM verdict: {}", s)),
        }
    }
}
impl FromStr for SpfVerdict {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pass" => Ok(SpfVerdict::Pass),
            "fail" | "hardfail" => Ok(SpfVerdict::Fail),
            "softfail" => Ok(SpfVerdict::SoftFail),
            "neutral" => Ok(SpfVerdict::Neutral),
            "temperror" => Ok(SpfVerdict::TempError),
            "permerror" => Ok(SpfVerdict::PermError),
            "none" => Ok(SpfVerdict::None),
            _ => Err(format!("Invalid SPF verdict: {}", s)),
        }
    }
}
impl FromStr for AlignmentMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "r" | "relaxed" => Ok(AlignmentMode::Relaxed),
            "s" | "strict" => Ok(AlignmentMode::Strict),
            _ => Err(format!("Invalid alignment mode: {}", s)),
        }
    }
}
impl FromStr for PolicyType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(PolicyType::None),
            "quarantine" => Ok(PolicyType::Quarantine),
            "reject" => Ok(PolicyType::Reject),
            _ => Err(format!("Invalid policy type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_parsing_is_case_insensitive() {
        assert_eq!("PASS".parse::<DkimVerdict>(), Ok(DkimVerdict::Pass));
        assert_eq!("SoftFail".parse::<SpfVerdict>(), Ok(SpfVerdict::SoftFail));
        assert_eq!("hardfail".parse::<SpfVerdict>(), Ok(SpfVerdict::Fail));
        assert!("bogus".parse::<DkimVerdict>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for v in [
            SpfVerdict::None,
            SpfVerdict::Neutral,
            SpfVerdict::Pass,
            SpfVerdict::Fail,
            SpfVerdict::SoftFail,
            SpfVerdict::TempError,
            SpfVerdict::PermError,
        ] {
            assert_eq!(v.to_string().parse::<SpfVerdict>(), Ok(v));
        }
        assert_eq!(AlignmentMode::Strict.as_tag().parse::<AlignmentMode>(), Ok(AlignmentMode::Strict));
    }

    #[test]
    fn test_absent_alignment_defaults_to_relaxed() {
        let policy = PublishedPolicy {
            domain: "example.com".into(),
            adkim: None,
            aspf: Some(AlignmentMode::Strict),
            policy: PolicyType::Reject,
            subdomain_policy: None,
            pct: 100,
            fo: None,
        };
        assert_eq!(policy.dkim_alignment(), AlignmentMode::Relaxed);
        assert_eq!(policy.spf_alignment(), AlignmentMode::Strict);
    }
}

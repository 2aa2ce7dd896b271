//! Persistence Module
//!
//! SQLite-backed storage for evaluated reports, accessed through `sqlx`. The
//! store is the single owner of the on-disk layout:
//!
//! - `reports`: metadata, published policy and the per-report message totals,
//!   unique on `(org_name, report_id)`.
//! - `records`: one row per report record with its stored compliance outcome.
//! - `dkim_results` / `spf_results`: authentication results per record, keeping
//!   both the parsed verdict and the result string as reported.
//!
//! A [`Store`] is opened once at startup with [`Store::open`], cloned into every
//! component that needs it, and shut down with [`Store::close`]. Writes go
//! through a single write gate so only one write transaction runs at a time;
//! reads use the pool directly and, in WAL mode, never wait on that writer.

use crate::compliance::{compliance_rate, evaluate};
use crate::error::{DmarcError, Result};
use crate::models::{
    Compliance, DkimResult, PolicyEvaluated, PolicyOverrideReason, PublishedPolicy, Record, Report,
    ReportMetadata, ReportSummary, SaveOutcome, SpfResult,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 100;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        org_name TEXT NOT NULL,
        report_id TEXT NOT NULL,
        email TEXT NOT NULL,
        extra_contact_info TEXT,
        version TEXT,
        date_begin INTEGER NOT NULL,
        date_end INTEGER NOT NULL,
        errors TEXT NOT NULL,
        domain TEXT NOT NULL,
        adkim TEXT,
        aspf TEXT,
        policy TEXT NOT NULL,
        subdomain_policy TEXT,
        pct INTEGER NOT NULL,
        fo TEXT,
        total_messages INTEGER NOT NULL,
        compliant_messages INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (org_name, report_id)
    )",
    "CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        report_ref INTEGER NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        source_ip TEXT NOT NULL,
        count INTEGER NOT NULL,
        disposition TEXT NOT NULL,
        eval_dkim TEXT NOT NULL,
        eval_spf TEXT NOT NULL,
        reasons TEXT NOT NULL,
        header_from TEXT NOT NULL,
        envelope_from TEXT,
        envelope_to TEXT,
        spf_aligned BOOLEAN NOT NULL,
        dkim_aligned BOOLEAN NOT NULL,
        compliant BOOLEAN NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dkim_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_ref INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
        domain TEXT NOT NULL,
        selector TEXT NOT NULL,
        result TEXT NOT NULL,
        raw_result TEXT NOT NULL,
        human_result TEXT
    )",
    "CREATE TABLE IF NOT EXISTS spf_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_ref INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
        domain TEXT NOT NULL,
        scope TEXT,
        result TEXT NOT NULL,
        raw_result TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_reports_period ON reports(date_begin DESC)",
    "CREATE INDEX IF NOT EXISTS idx_reports_domain ON reports(domain)",
    "CREATE INDEX IF NOT EXISTS idx_records_report ON records(report_ref)",
    "CREATE INDEX IF NOT EXISTS idx_records_source_ip ON records(source_ip)",
    "CREATE INDEX IF NOT EXISTS idx_dkim_record ON dkim_results(record_ref)",
    "CREATE INDEX IF NOT EXISTS idx_spf_record ON spf_results(record_ref)",
];

/// Handle to the report database. Cheap to clone; all clones share one pool and one write gate.
#[derive(Debug, Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        log::debug!("Opened report store at {}", path.as_ref().display());
        Ok(Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Closes every pooled connection. Further calls on any clone will fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Persists `report` unless a report with the same `(org_name, report_id)` is already stored.
    ///
    /// The report is (re-)evaluated before writing so the stored compliance
    /// columns always come from the alignment algorithm. Metadata, policy and
    /// records are written in one transaction.
    pub async fn save(&self, report: &Report) -> Result<SaveOutcome> {
        let report = evaluate(report.clone());
        let meta = &report.metadata;
        let policy = &report.policy;

        let _guard = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO reports (
                org_name, report_id, email, extra_contact_info, version, date_begin, date_end,
                errors, domain, adkim, aspf, policy, subdomain_policy, pct, fo,
                total_messages, compliant_messages, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (org_name, report_id) DO NOTHING",
        )
        .bind(&meta.org_name)
        .bind(&meta.report_id)
        .bind(&meta.email)
        .bind(&meta.extra_contact_info)
        .bind(&report.version)
        .bind(meta.date_begin.timestamp())
        .bind(meta.date_end.timestamp())
        .bind(to_json(&meta.errors)?)
        .bind(&policy.domain)
        .bind(policy.adkim.as_ref().map(|m| m.as_tag()))
        .bind(policy.aspf.as_ref().map(|m| m.as_tag()))
        .bind(policy.policy.to_string())
        .bind(policy.subdomain_policy.as_ref().map(|p| p.to_string()))
        .bind(i64::from(policy.pct))
        .bind(&policy.fo)
        .bind(report.total_messages() as i64)
        .bind(report.compliant_count() as i64)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            log::info!(
                "Skipping duplicate report {} from {}",
                meta.report_id,
                meta.org_name
            );
            return Ok(SaveOutcome::Skipped);
        }
        let id = inserted.last_insert_rowid();

        for (position, record) in report.records.iter().enumerate() {
            let compliance = record.compliance.unwrap_or_default();
            let record_id = sqlx::query(
                "INSERT INTO records (
                    report_ref, position, source_ip, count, disposition, eval_dkim, eval_spf,
                    reasons, header_from, envelope_from, envelope_to,
                    spf_aligned, dkim_aligned, compliant
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(position as i64)
            .bind(record.source_ip.to_string())
            .bind(i64::from(record.count))
            .bind(&record.policy_evaluated.disposition)
            .bind(record.policy_evaluated.dkim.to_string())
            .bind(record.policy_evaluated.spf.to_string())
            .bind(to_json(&record.policy_evaluated.reasons)?)
            .bind(&record.header_from)
            .bind(&record.envelope_from)
            .bind(&record.envelope_to)
            .bind(compliance.spf_aligned)
            .bind(compliance.dkim_aligned)
            .bind(compliance.compliant)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for dkim in &record.dkim {
                sqlx::query(
                    "INSERT INTO dkim_results (record_ref, domain, selector, result, raw_result, human_result)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(record_id)
                .bind(&dkim.domain)
                .bind(&dkim.selector)
                .bind(dkim.result.to_string())
                .bind(&dkim.raw_result)
                .bind(&dkim.human_result)
                .execute(&mut *tx)
                .await?;
            }
            for spf in &record.spf {
                sqlx::query(
                    "INSERT INTO spf_results (record_ref, domain, scope, result, raw_result)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(record_id)
                .bind(&spf.domain)
                .bind(&spf.scope)
                .bind(spf.result.to_string())
                .bind(&spf.raw_result)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        log::info!(
            "Saved report {} from {} (domain: {}, messages: {})",
            meta.report_id,
            meta.org_name,
            policy.domain,
            report.total_messages()
        );
        Ok(SaveOutcome::Inserted(id))
    }

    /// Loads the full report stored under database id `id`.
    pub async fn get_by_id(&self, id: i64) -> Result<Report> {
        let row = sqlx::query("SELECT * FROM reports WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DmarcError::NotFound(id))?;

        let metadata = ReportMetadata {
            org_name: row.try_get("org_name")?,
            email: row.try_get("email")?,
            extra_contact_info: row.try_get("extra_contact_info")?,
            report_id: row.try_get("report_id")?,
            date_begin: timestamp(&row, "date_begin")?,
            date_end: timestamp(&row, "date_end")?,
            errors: from_json(&row, "errors")?,
        };
        let policy = PublishedPolicy {
            domain: row.try_get("domain")?,
            adkim: parse_optional(&row, "adkim")?,
            aspf: parse_optional(&row, "aspf")?,
            policy: parse_column(&row, "policy")?,
            subdomain_policy: parse_optional(&row, "subdomain_policy")?,
            pct: u8::try_from(row.try_get::<i64, _>("pct")?)
                .map_err(|e| DmarcError::malformed("pct", e))?,
            fo: row.try_get("fo")?,
        };

        let record_rows = sqlx::query("SELECT * FROM records WHERE report_ref = ? ORDER BY position")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        let mut records = Vec::with_capacity(record_rows.len());
        for row in &record_rows {
            records.push(self.load_record(row).await?);
        }

        Ok(Report {
            version: row.try_get("version")?,
            metadata,
            policy,
            records,
        })
    }

    async fn load_record(&self, row: &SqliteRow) -> Result<Record> {
        let record_id: i64 = row.try_get("id")?;
        let dkim = sqlx::query("SELECT * FROM dkim_results WHERE record_ref = ? ORDER BY id")
            .bind(record_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| {
                Ok(DkimResult {
                    domain: r.try_get("domain")?,
                    selector: r.try_get("selector")?,
                    result: parse_column(r, "result")?,
                    raw_result: r.try_get("raw_result")?,
                    human_result: r.try_get("human_result")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let spf = sqlx::query("SELECT * FROM spf_results WHERE record_ref = ? ORDER BY id")
            .bind(record_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| {
                Ok(SpfResult {
                    domain: r.try_get("domain")?,
                    scope: r.try_get("scope")?,
                    result: parse_column(r, "result")?,
                    raw_result: r.try_get("raw_result")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Record {
            source_ip: parse_column(row, "source_ip")?,
            count: u32::try_from(row.try_get::<i64, _>("count")?)
                .map_err(|e| DmarcError::malformed("count", e))?,
            policy_evaluated: PolicyEvaluated {
                disposition: row.try_get("disposition")?,
                dkim: parse_column(row, "eval_dkim")?,
                spf: parse_column(row, "eval_spf")?,
                reasons: from_json::<Vec<PolicyOverrideReason>>(row, "reasons")?,
            },
            header_from: row.try_get("header_from")?,
            envelope_from: row.try_get("envelope_from")?,
            envelope_to: row.try_get("envelope_to")?,
            dkim,
            spf,
            compliance: Some(Compliance {
                spf_aligned: row.try_get("spf_aligned")?,
                dkim_aligned: row.try_get("dkim_aligned")?,
                compliant: row.try_get("compliant")?,
            }),
        })
    }

    /// Report summaries, most recent reporting period first.
    ///
    /// `limit <= 0` selects the default page size; larger values are clamped to
    /// [`MAX_LIST_LIMIT`]. A negative `offset` is treated as zero.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ReportSummary>> {
        let limit = if limit <= 0 {
            DEFAULT_LIST_LIMIT
        } else {
            limit.min(MAX_LIST_LIMIT)
        };
        let offset = offset.max(0);

        let rows = sqlx::query(
            "SELECT id, org_name, domain, date_begin, date_end, total_messages, compliant_messages
             FROM reports
             ORDER BY date_begin DESC, id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let total: i64 = row.try_get("total_messages")?;
                let compliant: i64 = row.try_get("compliant_messages")?;
                Ok(ReportSummary {
                    id: row.try_get("id")?,
                    org_name: row.try_get("org_name")?,
                    domain: row.try_get("domain")?,
                    period_begin: timestamp(row, "date_begin")?,
                    period_end: timestamp(row, "date_end")?,
                    total_messages: total,
                    compliance_rate: compliance_rate(compliant as u64, total as u64),
                })
            })
            .collect()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DmarcError::malformed("json", e))
}

fn from_json<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| DmarcError::malformed(column, e))
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = row.try_get(column)?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DmarcError::malformed(column, format!("{} is out of range", secs)))
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| DmarcError::malformed(column, e))
}

fn parse_optional<T>(row: &SqliteRow, column: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| s.parse().map_err(|e| DmarcError::malformed(column, e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use tempfile::tempdir;

    fn report_xml(org: &str, id: &str, begin: i64, ip: &str, count: u32) -> String {
        format!(
            r#"<feedback>
  <report_metadata>
    <org_name>{org}</org_name><email>r@{org}</email><report_id>{id}</report_id>
    <date_range><begin>{begin}</begin><end>{end}</end></date_range>
  </report_metadata>
  <policy_published><domain>example.com</domain><p>none</p></policy_published>
  <record>
    <row><source_ip>{ip}</source_ip><count>{count}</count>
      <policy_evaluated><disposition>none</disposition><dkim>pass</dkim><spf>fail</spf></policy_evaluated>
    </row>
    <identifiers><header_from>example.com</header_from></identifiers>
    <auth_results>
      <dkim><domain>example.com</domain><selector>s</selector><result>pass</result></dkim>
      <dkim><domain>other.net</domain><selector>t</selector><result>fail</result></dkim>
      <spf><domain>example.com</domain><scope>mfrom</scope><result>fail</result></spf>
    </auth_results>
  </record>
</feedback>"#,
            end = begin + 86_399
        )
    }

    async fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.sqlite")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let (_dir, store) = open_temp().await;
        let report = evaluate(decode(report_xml("google.com", "r1", 1_700_000_000, "198.51.100.7", 9).as_bytes()).unwrap());
        let outcome = store.save(&report).await.unwrap();
        let SaveOutcome::Inserted(id) = outcome else {
            panic!("expected insert, got {:?}", outcome);
        };
        let loaded = store.get_by_id(id).await.unwrap();
        assert_eq!(loaded, report);
        assert!(loaded.records[0].compliance.unwrap().compliant);
        store.close().await;
    }

    #[tokio::test]
    async fn test_second_save_is_skipped() {
        let (_dir, store) = open_temp().await;
        let report = decode(report_xml("google.com", "r1", 1_700_000_000, "198.51.100.7", 9).as_bytes()).unwrap();
        assert!(matches!(store.save(&report).await.unwrap(), SaveOutcome::Inserted(_)));
        assert_eq!(store.save(&report).await.unwrap(), SaveOutcome::Skipped);
        assert_eq!(store.list(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_report_id_from_other_org_is_distinct() {
        let (_dir, store) = open_temp().await;
        for org in ["google.com", "yahoo.com"] {
            let report = decode(report_xml(org, "r1", 1_700_000_000, "198.51.100.7", 9).as_bytes()).unwrap();
            assert!(matches!(store.save(&report).await.unwrap(), SaveOutcome::Inserted(_)));
        }
        assert_eq!(store.list(10, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_missing_report() {
        let (_dir, store) = open_temp().await;
        assert!(matches!(store.get_by_id(42).await, Err(DmarcError::NotFound(42))));
    }

    #[tokio::test]
    async fn test_list_order_and_paging() {
        let (_dir, store) = open_temp().await;
        for (i, begin) in [1_600_000_000i64, 1_700_000_000, 1_650_000_000].iter().enumerate() {
            let report = decode(report_xml("google.com", &format!("r{}", i), *begin, "198.51.100.7", 1).as_bytes()).unwrap();
            store.save(&report).await.unwrap();
        }
        let all = store.list(0, -5).await.unwrap();
        let begins: Vec<i64> = all.iter().map(|s| s.period_begin.timestamp()).collect();
        assert_eq!(begins, vec![1_700_000_000, 1_650_000_000, 1_600_000_000]);
        assert_eq!(all[0].compliance_rate, 100.0);

        let page = store.list(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].period_begin.timestamp(), 1_650_000_000);
        assert_eq!(store.list(1_000, 0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_saves_store_one_copy() {
        let (_dir, store) = open_temp().await;
        let report = decode(report_xml("google.com", "race", 1_700_000_000, "198.51.100.7", 3).as_bytes()).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let report = report.clone();
            handles.push(tokio::spawn(async move { store.save(&report).await }));
        }
        let mut inserted = 0;
        for handle in handles {
            if let SaveOutcome::Inserted(_) = handle.await.unwrap().unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.list(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reads_proceed_during_open_write() {
        let (_dir, store) = open_temp().await;
        let report = decode(report_xml("google.com", "r1", 1_700_000_000, "198.51.100.7", 9).as_bytes()).unwrap();
        store.save(&report).await.unwrap();

        // Hold the write gate with an uncommitted write transaction, as a save in flight would.
        let gate = store.write_gate.lock().await;
        let mut tx = store.pool.begin().await.unwrap();
        sqlx::query("UPDATE reports SET total_messages = 0, compliant_messages = 0")
            .execute(&mut *tx)
            .await
            .unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), store.statistics())
            .await
            .expect("statistics blocked behind the writer")
            .unwrap();
        assert_eq!(stats.total_reports, 1);
        assert_eq!(stats.total_messages, 9);
        let listed = tokio::time::timeout(Duration::from_secs(2), store.list(10, 0))
            .await
            .expect("list blocked behind the writer")
            .unwrap();
        assert_eq!(listed.len(), 1);

        tx.rollback().await.unwrap();
        drop(gate);
        assert_eq!(store.statistics().await.unwrap().total_messages, 9);
    }
}

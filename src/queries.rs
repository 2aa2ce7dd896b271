//! Query Module
//!
//! Read-side aggregations over everything stored in a [`Store`]. Each call runs
//! against the database as it is at that moment; nothing is cached.

use crate::compliance::compliance_rate;
use crate::error::Result;
use crate::models::{AuthResultStats, DomainStats, OrgStats, Statistics, TopSourceIp};
use crate::store::Store;
use sqlx::Row;

pub const DEFAULT_TOP_IPS: i64 = 10;
pub const MAX_TOP_IPS: i64 = 100;

impl Store {
    /// Corpus-wide totals, read in one statement so every figure comes from the same snapshot.
    pub async fn statistics(&self) -> Result<Statistics> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_reports,
                    COALESCE(SUM(total_messages), 0) AS total_messages,
                    COALESCE(SUM(compliant_messages), 0) AS compliant_messages,
                    COUNT(DISTINCT domain) AS unique_domains,
                    (SELECT COUNT(DISTINCT source_ip) FROM records) AS unique_source_ips
             FROM reports",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_messages: i64 = row.try_get("total_messages")?;
        let compliant: i64 = row.try_get("compliant_messages")?;
        Ok(Statistics {
            total_reports: row.try_get("total_reports")?,
            total_messages,
            compliance_rate: compliance_rate(compliant as u64, total_messages as u64),
            unique_source_ips: row.try_get("unique_source_ips")?,
            unique_domains: row.try_get("unique_domains")?,
        })
    }

    /// Source IPs ranked by message volume, ties broken by IP.
    ///
    /// `limit <= 0` selects [`DEFAULT_TOP_IPS`]; larger values are clamped to [`MAX_TOP_IPS`].
    pub async fn top_source_ips(&self, limit: i64) -> Result<Vec<TopSourceIp>> {
        let limit = if limit <= 0 {
            DEFAULT_TOP_IPS
        } else {
            limit.min(MAX_TOP_IPS)
        };
        let rows = sqlx::query(
            "SELECT source_ip,
                    SUM(count) AS total_count,
                    SUM(CASE WHEN compliant THEN count ELSE 0 END) AS pass_count
             FROM records
             GROUP BY source_ip
             ORDER BY total_count DESC, source_ip ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let total_count: i64 = row.try_get("total_count")?;
                let pass_count: i64 = row.try_get("pass_count")?;
                Ok(TopSourceIp {
                    ip: row.try_get("source_ip")?,
                    total_count,
                    pass_count,
                    fail_count: total_count - pass_count,
                })
            })
            .collect()
    }

    /// Message volume and compliance per evaluated (policy) domain.
    pub async fn domain_stats(&self) -> Result<Vec<DomainStats>> {
        let rows = sqlx::query(
            "SELECT domain,
                    SUM(total_messages) AS total_messages,
                    SUM(compliant_messages) AS compliant_messages
             FROM reports
             GROUP BY domain
             ORDER BY total_messages DESC, domain ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let total: i64 = row.try_get("total_messages")?;
                let compliant: i64 = row.try_get("compliant_messages")?;
                Ok(DomainStats {
                    domain: row.try_get("domain")?,
                    total_messages: total,
                    compliant_messages: compliant,
                    compliance_rate: compliance_rate(compliant as u64, total as u64),
                })
            })
            .collect()
    }

    /// Number of stored reports per reporting organization.
    pub async fn org_stats(&self) -> Result<Vec<OrgStats>> {
        let rows = sqlx::query(
            "SELECT org_name, COUNT(*) AS report_count
             FROM reports
             GROUP BY org_name
             ORDER BY report_count DESC, org_name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OrgStats {
                    org_name: row.try_get("org_name")?,
                    report_count: row.try_get("report_count")?,
                })
            })
            .collect()
    }

    /// Message counts per SPF result as reported, vendor values included.
    /// Records without an SPF result count as `none`.
    pub async fn spf_stats(&self) -> Result<Vec<AuthResultStats>> {
        self.auth_result_stats("spf_results").await
    }

    /// Message counts per raw DKIM result. Each signature contributes its record's count;
    /// unsigned records count as `none`.
    pub async fn dkim_stats(&self) -> Result<Vec<AuthResultStats>> {
        self.auth_result_stats("dkim_results").await
    }

    async fn auth_result_stats(&self, table: &'static str) -> Result<Vec<AuthResultStats>> {
        let sql = format!(
            "SELECT COALESCE(NULLIF(a.raw_result, ''), 'none') AS result, SUM(r.count) AS message_count
             FROM records r
             LEFT JOIN {table} a ON a.record_ref = r.id
             GROUP BY COALESCE(NULLIF(a.raw_result, ''), 'none')
             ORDER BY message_count DESC, result ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                Ok(AuthResultStats {
                    result: row.try_get("result")?,
                    count: row.try_get("message_count")?,
                })
            })
            .collect()
    }
}

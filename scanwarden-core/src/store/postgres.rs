use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanwarden_model::{
    ExternalJobRef, Finding, FindingId, PhaseProgress, ScanConfig, ScanJob,
    ScanJobId, ScanPhase, ScanState, SeverityCounts,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tracing::info;
use url::Url;
use uuid::Uuid;

use super::{FindingQuery, JobFilter, JobStore, StoreError};
use crate::MIGRATOR;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("scan job schema is up to date");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn classify(err: sqlx::Error, job_id: ScanJobId) -> StoreError {
    let code = err
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned());
    match code.as_deref() {
        Some(UNIQUE_VIOLATION) => StoreError::Conflict(format!(
            "scan job {job_id} collides with an existing record"
        )),
        Some(FOREIGN_KEY_VIOLATION) => StoreError::NotFound(job_id),
        _ => StoreError::Database(err),
    }
}

#[derive(sqlx::FromRow)]
struct ScanJobRow {
    id: Uuid,
    name: String,
    target_url: String,
    config: Json<ScanConfig>,
    state: String,
    progress_percent: i16,
    phase_progress: Json<PhaseProgress>,
    external_ref: Option<Json<ExternalJobRef>>,
    resume_phase: Option<String>,
    last_error: Option<String>,
    findings_count: i64,
    alert_cursor: Option<i64>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScanJobRow> for ScanJob {
    type Error = StoreError;

    fn try_from(row: ScanJobRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, detail: String| {
            StoreError::Corrupt(format!("scan job {}: {what}: {detail}", row.id))
        };
        let target_url = Url::parse(&row.target_url)
            .map_err(|err| corrupt("target_url", err.to_string()))?;
        let state = row
            .state
            .parse::<ScanState>()
            .map_err(|err| corrupt("state", err.to_string()))?;
        let resume_phase = row
            .resume_phase
            .as_deref()
            .map(str::parse::<ScanPhase>)
            .transpose()
            .map_err(|err| corrupt("resume_phase", err.to_string()))?;

        Ok(ScanJob {
            id: ScanJobId(row.id),
            name: row.name,
            target_url,
            config: row.config.0,
            state,
            progress_percent: row.progress_percent.clamp(0, 100) as u8,
            phase_progress: row.phase_progress.0,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            external_ref: row.external_ref.map(|json| json.0),
            resume_phase,
            last_error: row.last_error,
            findings_count: row.findings_count.max(0) as u64,
            alert_cursor: row.alert_cursor.map(|cursor| cursor.max(0) as u64),
        })
    }
}

#[derive(sqlx::FromRow)]
struct FindingRow {
    id: Uuid,
    scan_job_id: Uuid,
    engine_alert_id: String,
    name: String,
    severity: String,
    confidence: String,
    url: String,
    description: String,
    remediation: String,
    parameter: Option<String>,
    evidence: Option<String>,
    cwe_id: Option<i32>,
    discovered_at: DateTime<Utc>,
}

impl TryFrom<FindingRow> for Finding {
    type Error = StoreError;

    fn try_from(row: FindingRow) -> Result<Self, Self::Error> {
        let severity = row.severity.parse().map_err(|err| {
            StoreError::Corrupt(format!("finding {}: {err}", row.id))
        })?;
        let confidence = row.confidence.parse().map_err(|err| {
            StoreError::Corrupt(format!("finding {}: {err}", row.id))
        })?;
        Ok(Finding {
            id: FindingId(row.id),
            scan_job_id: ScanJobId(row.scan_job_id),
            engine_alert_id: row.engine_alert_id,
            name: row.name,
            severity,
            confidence,
            url: row.url,
            description: row.description,
            remediation: row.remediation,
            parameter: row.parameter,
            evidence: row.evidence,
            cwe_id: row.cwe_id,
            discovered_at: row.discovered_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, name, target_url, config, state, progress_percent, \
     phase_progress, external_ref, resume_phase, last_error, findings_count, \
     alert_cursor, started_at, completed_at, updated_at";

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scan_jobs (
                id, name, target_url, config, state, progress_percent,
                phase_progress, external_ref, resume_phase, last_error,
                findings_count, alert_cursor, started_at, completed_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id.to_uuid())
        .bind(&job.name)
        .bind(job.target_url.as_str())
        .bind(Json(&job.config))
        .bind(job.state.as_str())
        .bind(i16::from(job.progress_percent))
        .bind(Json(&job.phase_progress))
        .bind(job.external_ref.as_ref().map(Json))
        .bind(job.resume_phase.map(ScanPhase::as_str))
        .bind(job.last_error.as_deref())
        .bind(job.findings_count as i64)
        .bind(job.alert_cursor.map(|cursor| cursor as i64))
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| classify(err, job.id))?;
        Ok(())
    }

    async fn update_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs SET
                name = $2,
                state = $3,
                progress_percent = $4,
                phase_progress = $5,
                external_ref = $6,
                resume_phase = $7,
                last_error = $8,
                findings_count = $9,
                alert_cursor = $10,
                completed_at = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(job.id.to_uuid())
        .bind(&job.name)
        .bind(job.state.as_str())
        .bind(i16::from(job.progress_percent))
        .bind(Json(&job.phase_progress))
        .bind(job.external_ref.as_ref().map(Json))
        .bind(job.resume_phase.map(ScanPhase::as_str))
        .bind(job.last_error.as_deref())
        .bind(job.findings_count as i64)
        .bind(job.alert_cursor.map(|cursor| cursor as i64))
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| classify(err, job.id))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job.id));
        }
        Ok(())
    }

    async fn append_findings(
        &self,
        findings: &[Finding],
    ) -> Result<usize, StoreError> {
        if findings.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for finding in findings {
            let result = sqlx::query(
                r#"
                INSERT INTO scan_findings (
                    id, scan_job_id, engine_alert_id, name, severity, confidence,
                    url, description, remediation, parameter, evidence, cwe_id,
                    discovered_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(finding.id.as_uuid())
            .bind(finding.scan_job_id.to_uuid())
            .bind(&finding.engine_alert_id)
            .bind(&finding.name)
            .bind(finding.severity.as_str())
            .bind(finding.confidence.as_str())
            .bind(&finding.url)
            .bind(&finding.description)
            .bind(&finding.remediation)
            .bind(finding.parameter.as_deref())
            .bind(finding.evidence.as_deref())
            .bind(finding.cwe_id)
            .bind(finding.discovered_at)
            .execute(&mut *tx)
            .await
            .map_err(|err| classify(err, finding.scan_job_id))?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_job(&self, id: ScanJobId) -> Result<Option<ScanJob>, StoreError> {
        let row = sqlx::query_as::<_, ScanJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScanJob::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScanJob>, StoreError> {
        let states: Option<Vec<String>> = filter.states.as_ref().map(|states| {
            states.iter().map(|state| state.as_str().to_string()).collect()
        });
        let rows = sqlx::query_as::<_, ScanJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs \
             WHERE ($1::text[] IS NULL OR state = ANY($1)) \
             ORDER BY started_at ASC, id ASC"
        ))
        .bind(states)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ScanJob::try_from).collect()
    }

    async fn list_findings(
        &self,
        query: &FindingQuery,
    ) -> Result<Vec<Finding>, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, scan_job_id, engine_alert_id, name, severity, confidence, \
             url, description, remediation, parameter, evidence, cwe_id, \
             discovered_at FROM scan_findings WHERE TRUE",
        );
        if let Some(job_id) = query.scan_job_id {
            builder.push(" AND scan_job_id = ").push_bind(job_id.to_uuid());
        }
        if let Some(severity) = query.severity {
            builder.push(" AND severity = ").push_bind(severity.as_str());
        }
        if let Some(since) = query.since {
            builder.push(" AND discovered_at >= ").push_bind(since);
        }
        if let Some(until) = query.until {
            builder.push(" AND discovered_at <= ").push_bind(until);
        }
        builder.push(" ORDER BY discovered_at DESC, id DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build_query_as::<FindingRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Finding::try_from).collect()
    }

    async fn severity_counts(
        &self,
        scan_job_id: Option<ScanJobId>,
    ) -> Result<SeverityCounts, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT severity, COUNT(*)
            FROM scan_findings
            WHERE ($1::uuid IS NULL OR scan_job_id = $1)
            GROUP BY severity
            "#,
        )
        .bind(scan_job_id.map(|id| id.to_uuid()))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = SeverityCounts::default();
        for (severity, count) in rows {
            let severity = severity
                .parse()
                .map_err(|err| StoreError::Corrupt(format!("severity bucket: {err}")))?;
            counts.add(severity, count.max(0) as u64);
        }
        Ok(counts)
    }
}

//! PostgreSQL 存储实现

use async_trait::async_trait;
use chrono::NaiveDate;
use medq_core::{
    AuditRecord, AuditSink, ChangeSet, DiagnosticEntry, Doctor, MedqError, OpdEntry,
    Prescription, QueueEntry, QueueKey, QueueStore, Result, TestType, Versioned, Visit,
};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::connection::DatabasePool;
use crate::models::*;

const VISIT_COLUMNS: &str = "id, patient_id, doctor_id, token, service_date, external_reference, \
     is_emergency, emergency_reason, is_protected, status, diagnosis, created_at, completed_at";
const OPD_COLUMNS: &str =
    "id, visit_id, doctor_id, token, service_date, status, priority, created_at, updated_at";
const DIAGNOSTIC_COLUMNS: &str =
    "id, visit_id, test_type, status, priority, is_emergency, result, created_at, updated_at";
const DOCTOR_COLUMNS: &str =
    "id, name, department, opd_room, work_status, delay_reason, last_action_at, created_at";

/// PostgreSQL 队列存储
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: DatabasePool,
}

impl PgQueueStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS doctors (
                id UUID PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                department VARCHAR(255) NOT NULL,
                opd_room VARCHAR(64) NOT NULL,
                work_status VARCHAR(20) NOT NULL DEFAULT 'AVAILABLE',
                delay_reason TEXT,
                last_action_at TIMESTAMP WITH TIME ZONE NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS visits (
                id UUID PRIMARY KEY,
                patient_id UUID NOT NULL,
                doctor_id UUID NOT NULL REFERENCES doctors(id),
                token INTEGER NOT NULL,
                service_date DATE NOT NULL,
                external_reference VARCHAR(64) UNIQUE NOT NULL,
                is_emergency BOOLEAN NOT NULL DEFAULT FALSE,
                emergency_reason TEXT,
                is_protected BOOLEAN NOT NULL DEFAULT TRUE,
                status VARCHAR(20) NOT NULL DEFAULT 'WAITING',
                diagnosis TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                completed_at TIMESTAMP WITH TIME ZONE,
                UNIQUE (doctor_id, service_date, token)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS opd_entries (
                id UUID PRIMARY KEY,
                visit_id UUID UNIQUE NOT NULL REFERENCES visits(id),
                doctor_id UUID NOT NULL REFERENCES doctors(id),
                token INTEGER NOT NULL,
                service_date DATE NOT NULL,
                status VARCHAR(20) NOT NULL,
                priority SMALLINT NOT NULL DEFAULT 0,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS diagnostic_entries (
                id UUID PRIMARY KEY,
                visit_id UUID NOT NULL REFERENCES visits(id),
                test_type VARCHAR(16) NOT NULL,
                status VARCHAR(20) NOT NULL,
                priority SMALLINT NOT NULL DEFAULT 0,
                is_emergency BOOLEAN NOT NULL DEFAULT FALSE,
                result TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS prescriptions (
                id UUID PRIMARY KEY,
                visit_id UUID NOT NULL REFERENCES visits(id),
                medicine_name VARCHAR(255) NOT NULL,
                dosage VARCHAR(255),
                created_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS token_sequences (
                doctor_id UUID NOT NULL,
                service_date DATE NOT NULL,
                last_token INTEGER NOT NULL,
                PRIMARY KEY (doctor_id, service_date)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS queue_versions (
                queue_key VARCHAR(64) PRIMARY KEY,
                version BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY,
                action VARCHAR(32) NOT NULL,
                actor_id UUID NOT NULL,
                visit_id UUID NOT NULL,
                reason TEXT NOT NULL,
                recorded_at TIMESTAMP WITH TIME ZONE NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(pool).await?;
        }

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_opd_entries_doctor_status ON opd_entries(doctor_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_diagnostic_entries_type_status ON diagnostic_entries(test_type, status)",
            "CREATE INDEX IF NOT EXISTS idx_diagnostic_entries_visit ON diagnostic_entries(visit_id)",
            "CREATE INDEX IF NOT EXISTS idx_prescriptions_visit ON prescriptions(visit_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_log_recorded_at ON audit_log(recorded_at)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }

    async fn read_version(tx: &mut Transaction<'_, Postgres>, key: &QueueKey) -> Result<u64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM queue_versions WHERE queue_key = $1")
                .bind(key.storage_key())
                .fetch_optional(&mut **tx)
                .await?;
        Ok(version.unwrap_or(0) as u64)
    }

    /// 校验并递增一个受保护队列的版本
    async fn guard_version(
        tx: &mut Transaction<'_, Postgres>,
        key: &QueueKey,
        expected: u64,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE queue_versions SET version = version + 1 WHERE queue_key = $1 AND version = $2",
        )
        .bind(key.storage_key())
        .bind(expected as i64)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }

        if expected == 0 {
            let inserted = sqlx::query(
                "INSERT INTO queue_versions (queue_key, version) VALUES ($1, 1) ON CONFLICT (queue_key) DO NOTHING",
            )
            .bind(key.storage_key())
            .execute(&mut **tx)
            .await?
            .rows_affected();

            if inserted == 1 {
                return Ok(());
            }
        }

        Err(MedqError::Conflict(format!(
            "queue {} changed since version {}",
            key, expected
        )))
    }

    async fn bump_version(tx: &mut Transaction<'_, Postgres>, key: &QueueKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_versions (queue_key, version) VALUES ($1, 1)
            ON CONFLICT (queue_key) DO UPDATE SET version = queue_versions.version + 1
            "#,
        )
        .bind(key.storage_key())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_doctor(tx: &mut Transaction<'_, Postgres>, doctor: &Doctor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO doctors (id, name, department, opd_room, work_status, delay_reason, last_action_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                department = EXCLUDED.department,
                opd_room = EXCLUDED.opd_room,
                work_status = EXCLUDED.work_status,
                delay_reason = EXCLUDED.delay_reason,
                last_action_at = EXCLUDED.last_action_at
            "#,
        )
        .bind(doctor.id)
        .bind(&doctor.name)
        .bind(&doctor.department)
        .bind(&doctor.opd_room)
        .bind(doctor.work_status.as_str())
        .bind(&doctor.delay_reason)
        .bind(doctor.last_action_at)
        .bind(doctor.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_visit(tx: &mut Transaction<'_, Postgres>, visit: &Visit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO visits (id, patient_id, doctor_id, token, service_date, external_reference,
                                is_emergency, emergency_reason, is_protected, status, diagnosis,
                                created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                is_emergency = EXCLUDED.is_emergency,
                emergency_reason = EXCLUDED.emergency_reason,
                status = EXCLUDED.status,
                diagnosis = EXCLUDED.diagnosis,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(visit.id)
        .bind(visit.patient_id)
        .bind(visit.doctor_id)
        .bind(visit.token)
        .bind(visit.service_date)
        .bind(&visit.external_reference)
        .bind(visit.is_emergency)
        .bind(&visit.emergency_reason)
        .bind(visit.is_protected)
        .bind(visit.status.as_str())
        .bind(&visit.diagnosis)
        .bind(visit.created_at)
        .bind(visit.completed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_opd_entry(tx: &mut Transaction<'_, Postgres>, entry: &OpdEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO opd_entries (id, visit_id, doctor_id, token, service_date, status, priority, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entry.id)
        .bind(entry.visit_id)
        .bind(entry.doctor_id)
        .bind(entry.token)
        .bind(entry.service_date)
        .bind(entry.status.as_str())
        .bind(priority_to_db(entry.priority))
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_diagnostic(
        tx: &mut Transaction<'_, Postgres>,
        entry: &DiagnosticEntry,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO diagnostic_entries (id, visit_id, test_type, status, priority, is_emergency, result, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                is_emergency = EXCLUDED.is_emergency,
                result = EXCLUDED.result,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entry.id)
        .bind(entry.visit_id)
        .bind(entry.test_type.as_str())
        .bind(entry.status.as_str())
        .bind(priority_to_db(entry.priority))
        .bind(entry.is_emergency)
        .bind(&entry.result)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_prescription(
        tx: &mut Transaction<'_, Postgres>,
        prescription: &Prescription,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prescriptions (id, visit_id, medicine_name, dosage, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(prescription.id)
        .bind(prescription.visit_id)
        .bind(&prescription.medicine_name)
        .bind(&prescription.dosage)
        .bind(prescription.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn allocate_token(&self, doctor_id: Uuid, day: NaiveDate) -> Result<i32> {
        let token: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO token_sequences (doctor_id, service_date, last_token) VALUES ($1, $2, 1)
            ON CONFLICT (doctor_id, service_date)
            DO UPDATE SET last_token = token_sequences.last_token + 1
            RETURNING last_token
            "#,
        )
        .bind(doctor_id)
        .bind(day)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(token)
    }

    async fn get_visit(&self, visit_id: Uuid) -> Result<Option<Visit>> {
        let row = sqlx::query_as::<_, DbVisit>(&format!(
            "SELECT {} FROM visits WHERE id = $1",
            VISIT_COLUMNS
        ))
        .bind(visit_id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Visit::try_from).transpose()
    }

    async fn find_visit_by_reference(&self, reference: &str) -> Result<Option<Visit>> {
        let row = sqlx::query_as::<_, DbVisit>(&format!(
            "SELECT {} FROM visits WHERE external_reference = $1",
            VISIT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Visit::try_from).transpose()
    }

    async fn get_doctor(&self, doctor_id: Uuid) -> Result<Option<Doctor>> {
        let row = sqlx::query_as::<_, DbDoctor>(&format!(
            "SELECT {} FROM doctors WHERE id = $1",
            DOCTOR_COLUMNS
        ))
        .bind(doctor_id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Doctor::try_from).transpose()
    }

    async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        let rows = sqlx::query_as::<_, DbDoctor>(&format!(
            "SELECT {} FROM doctors ORDER BY name, id",
            DOCTOR_COLUMNS
        ))
        .fetch_all(self.pool.pool())
        .await?;
        rows.into_iter().map(Doctor::try_from).collect()
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<QueueEntry>> {
        let opd = sqlx::query_as::<_, DbOpdEntry>(&format!(
            "SELECT {} FROM opd_entries WHERE id = $1",
            OPD_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(self.pool.pool())
        .await?;
        if let Some(row) = opd {
            return Ok(Some(QueueEntry::Opd(OpdEntry::try_from(row)?)));
        }

        let diagnostic = sqlx::query_as::<_, DbDiagnosticEntry>(&format!(
            "SELECT {} FROM diagnostic_entries WHERE id = $1",
            DIAGNOSTIC_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(self.pool.pool())
        .await?;
        diagnostic
            .map(|row| DiagnosticEntry::try_from(row).map(QueueEntry::Diagnostic))
            .transpose()
    }

    async fn opd_entry_for_visit(&self, visit_id: Uuid) -> Result<Option<OpdEntry>> {
        let row = sqlx::query_as::<_, DbOpdEntry>(&format!(
            "SELECT {} FROM opd_entries WHERE visit_id = $1",
            OPD_COLUMNS
        ))
        .bind(visit_id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(OpdEntry::try_from).transpose()
    }

    async fn diagnostics_for_visit(&self, visit_id: Uuid) -> Result<Vec<DiagnosticEntry>> {
        let rows = sqlx::query_as::<_, DbDiagnosticEntry>(&format!(
            "SELECT {} FROM diagnostic_entries WHERE visit_id = $1 ORDER BY created_at, id",
            DIAGNOSTIC_COLUMNS
        ))
        .bind(visit_id)
        .fetch_all(self.pool.pool())
        .await?;
        rows.into_iter().map(DiagnosticEntry::try_from).collect()
    }

    async fn prescriptions_for_visit(&self, visit_id: Uuid) -> Result<Vec<Prescription>> {
        let rows = sqlx::query_as::<_, DbPrescription>(
            "SELECT id, visit_id, medicine_name, dosage, created_at FROM prescriptions WHERE visit_id = $1 ORDER BY created_at",
        )
        .bind(visit_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.into_iter().map(Prescription::from).collect())
    }

    async fn load_opd_queue(&self, doctor_id: Uuid) -> Result<Versioned<Vec<OpdEntry>>> {
        let mut tx = self.pool.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let version = Self::read_version(&mut tx, &QueueKey::Opd { doctor_id }).await?;
        let rows = sqlx::query_as::<_, DbOpdEntry>(&format!(
            "SELECT {} FROM opd_entries WHERE doctor_id = $1 AND status <> 'COMPLETED' ORDER BY service_date, token",
            OPD_COLUMNS
        ))
        .bind(doctor_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let value = rows
            .into_iter()
            .map(OpdEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Versioned { version, value })
    }

    async fn load_diagnostic_queue(
        &self,
        test_type: TestType,
    ) -> Result<Versioned<Vec<DiagnosticEntry>>> {
        let mut tx = self.pool.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let version = Self::read_version(&mut tx, &QueueKey::Diagnostic { test_type }).await?;
        let rows = sqlx::query_as::<_, DbDiagnosticEntry>(&format!(
            "SELECT {} FROM diagnostic_entries WHERE test_type = $1 AND status <> 'COMPLETED' ORDER BY created_at, id",
            DIAGNOSTIC_COLUMNS
        ))
        .bind(test_type.as_str())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let value = rows
            .into_iter()
            .map(DiagnosticEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Versioned { version, value })
    }

    async fn queue_version(&self, key: QueueKey) -> Result<u64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM queue_versions WHERE queue_key = $1")
                .bind(key.storage_key())
                .fetch_optional(self.pool.pool())
                .await?;
        Ok(version.unwrap_or(0) as u64)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut tx = self.pool.pool().begin().await?;

        let mut guarded = Vec::with_capacity(changes.expected.len());
        for (key, expected) in &changes.expected {
            Self::guard_version(&mut tx, key, *expected).await?;
            guarded.push(key.storage_key());
        }
        for key in changes.touched_queues() {
            if !guarded.contains(&key.storage_key()) {
                Self::bump_version(&mut tx, &key).await?;
            }
        }

        for doctor in &changes.doctors {
            Self::upsert_doctor(&mut tx, doctor).await?;
        }
        for visit in &changes.visits {
            Self::upsert_visit(&mut tx, visit).await?;
        }
        for entry in &changes.opd_entries {
            Self::upsert_opd_entry(&mut tx, entry).await?;
        }
        for entry in &changes.diagnostics {
            Self::upsert_diagnostic(&mut tx, entry).await?;
        }
        for prescription in &changes.prescriptions {
            Self::insert_prescription(&mut tx, prescription).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// PostgreSQL 审计日志
#[derive(Debug, Clone)]
pub struct PgAuditLog {
    pool: DatabasePool,
}

impl PgAuditLog {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditLog {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, action, actor_id, visit_id, reason, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.action.as_str())
        .bind(record.actor_id)
        .bind(record.visit_id)
        .bind(&record.reason)
        .bind(record.recorded_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, DbAuditRecord>(
            "SELECT id, action, actor_id, visit_id, reason, recorded_at FROM audit_log ORDER BY recorded_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(self.pool.pool())
        .await?;

        rows.into_iter().map(AuditRecord::try_from).collect()
    }
}

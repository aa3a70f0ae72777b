//! A Postgres backed implementation of the metadata store

use crate::interface::{
    Catalog, Error, InstanceStatusRepo, MaterializationJobRepo, RawFileMetadataParams,
    RawFileMetadataRepo, RepoCollection, Result, Transaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestInstanceStatus, DirectIngestStatus,
    IngestViewMaterializationArgs, IngestViewMaterializationMetadata, RawFileId, RawFileMetadata,
    StateCode,
};
use iox_time::{SystemProvider, TimeProvider};
use observability_deps::tracing::info;
use sqlx::{
    Executor, Postgres,
    migrate::Migrator,
    postgres::{PgConnectOptions, PgPool, PgPoolOptions},
};
use std::{fmt::Display, str::FromStr, sync::Arc, time::Duration};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Postgres connection options.
#[derive(Debug, Clone)]
pub struct PostgresConnectionOptions {
    /// Application name.
    ///
    /// This will be reported to postgres.
    pub app_name: String,

    /// Schema name.
    pub schema_name: String,

    /// DSN.
    pub dsn: String,

    /// Maximum number of concurrent connections.
    pub max_conns: u32,

    /// Set the amount of time to attempt connecting to the database.
    pub connect_timeout: Duration,

    /// Set a maximum idle duration for individual connections.
    pub idle_timeout: Duration,
}

impl PostgresConnectionOptions {
    /// Default value for [`schema_name`](Self::schema_name).
    pub const DEFAULT_SCHEMA_NAME: &'static str = "direct_ingest_operations";

    /// Default value for [`max_conns`](Self::max_conns).
    pub const DEFAULT_MAX_CONNS: u32 = 10;

    /// Default value for [`connect_timeout`](Self::connect_timeout).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default value for [`idle_timeout`](Self::idle_timeout).
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for PostgresConnectionOptions {
    fn default() -> Self {
        Self {
            app_name: String::from("direct_ingest"),
            schema_name: String::from(Self::DEFAULT_SCHEMA_NAME),
            dsn: String::new(),
            max_conns: Self::DEFAULT_MAX_CONNS,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// PostgreSQL metadata store.
#[derive(Debug)]
pub struct PostgresCatalog {
    pool: PgPool,
    time_provider: Arc<dyn TimeProvider>,
    // Connection options for display
    options: PostgresConnectionOptions,
}

impl PostgresCatalog {
    /// Connect to the metadata store.
    pub async fn connect(options: PostgresConnectionOptions) -> Result<Self> {
        let pool = new_pool(&options)
            .await
            .map_err(|e| Error::SqlxError { source: e })?;

        Ok(Self {
            pool,
            time_provider: Arc::new(SystemProvider::new()),
            options,
        })
    }

    fn schema_name(&self) -> &str {
        &self.options.schema_name
    }
}

impl Display for PostgresCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            // Do not include dsn in log as it may have credentials
            // that should not end up in the log
            "Postgres(dsn=OMITTED, schema_name='{}')",
            self.schema_name()
        )
    }
}

async fn new_pool(options: &PostgresConnectionOptions) -> Result<PgPool, sqlx::Error> {
    let connect_options = PgConnectOptions::from_str(&options.dsn)?;

    let app_name = options.app_name.clone();
    let schema_name = options.schema_name.clone();
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(options.max_conns)
        .acquire_timeout(options.connect_timeout)
        .idle_timeout(options.idle_timeout)
        .test_before_acquire(true)
        .after_connect(move |c, _meta| {
            let app_name = app_name.to_owned();
            let schema_name = schema_name.to_owned();
            Box::pin(async move {
                // Tag the connection with the application name unless the DSN
                // already set one.
                let current_application_name: String =
                    sqlx::query_scalar("SELECT current_setting('application_name');")
                        .fetch_one(&mut *c)
                        .await?;
                if current_application_name.is_empty() {
                    sqlx::query("SELECT set_config('application_name', $1, false);")
                        .bind(&*app_name)
                        .execute(&mut *c)
                        .await?;
                }
                let search_path_query = format!("SET search_path TO {schema_name},public;");
                c.execute(sqlx::query(&search_path_query)).await?;

                c.execute("SET timezone = 'UTC';").await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    info!(application_name = %options.app_name, "connected to metadata store");
    Ok(pool)
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn setup(&self) -> Result<()> {
        // The schema must exist before the migrations run, otherwise sqlx puts its
        // bookkeeping table in `public` on the first run only.
        let create_schema_query = format!("CREATE SCHEMA IF NOT EXISTS {};", self.schema_name());
        self.pool
            .execute(sqlx::query(&create_schema_query))
            .await
            .map_err(|e| Error::Setup { source: e })?;

        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Setup { source: e.into() })?;

        Ok(())
    }

    async fn start_transaction(&self) -> Result<Box<dyn Transaction>> {
        let transaction = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::SqlxError { source: e })?;

        Ok(Box::new(PostgresTxn {
            inner: PgConn::Txn(transaction),
        }))
    }

    async fn repositories(&self) -> Box<dyn RepoCollection> {
        Box::new(PostgresTxn {
            inner: PgConn::Oneshot(self.pool.clone()),
        })
    }

    fn time_provider(&self) -> Arc<dyn TimeProvider> {
        Arc::clone(&self.time_provider)
    }
}

enum PgConn {
    Txn(sqlx::Transaction<'static, Postgres>),
    /// Every statement checks out its own connection.
    Oneshot(PgPool),
}

impl std::fmt::Debug for PgConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Txn(_) => f.write_str("Txn"),
            Self::Oneshot(pool) => f.debug_tuple("Oneshot").field(pool).finish(),
        }
    }
}

/// Transaction for [`PostgresCatalog`].
#[derive(Debug)]
pub struct PostgresTxn {
    inner: PgConn,
}

impl<'c> Executor<'c> for &'c mut PgConn {
    type Database = Postgres;

    #[allow(clippy::type_complexity)]
    fn fetch_many<'e, 'q: 'e, E: 'q>(
        self,
        query: E,
    ) -> futures::stream::BoxStream<
        'e,
        Result<
            sqlx::Either<
                <Self::Database as sqlx::Database>::QueryResult,
                <Self::Database as sqlx::Database>::Row,
            >,
            sqlx::Error,
        >,
    >
    where
        'c: 'e,
        E: sqlx::Execute<'q, Self::Database>,
    {
        match self {
            PgConn::Txn(txn) => (&mut **txn).fetch_many(query),
            PgConn::Oneshot(pool) => (&*pool).fetch_many(query),
        }
    }

    fn fetch_optional<'e, 'q: 'e, E: 'q>(
        self,
        query: E,
    ) -> futures::future::BoxFuture<
        'e,
        Result<Option<<Self::Database as sqlx::Database>::Row>, sqlx::Error>,
    >
    where
        'c: 'e,
        E: sqlx::Execute<'q, Self::Database>,
    {
        match self {
            PgConn::Txn(txn) => (&mut **txn).fetch_optional(query),
            PgConn::Oneshot(pool) => (&*pool).fetch_optional(query),
        }
    }

    fn prepare_with<'e, 'q: 'e>(
        self,
        sql: &'q str,
        parameters: &'e [<Self::Database as sqlx::Database>::TypeInfo],
    ) -> futures::future::BoxFuture<
        'e,
        Result<<Self::Database as sqlx::database::HasStatement<'q>>::Statement, sqlx::Error>,
    >
    where
        'c: 'e,
    {
        match self {
            PgConn::Txn(txn) => (&mut **txn).prepare_with(sql, parameters),
            PgConn::Oneshot(pool) => (&*pool).prepare_with(sql, parameters),
        }
    }

    fn describe<'e, 'q: 'e>(
        self,
        sql: &'q str,
    ) -> futures::future::BoxFuture<'e, Result<sqlx::Describe<Self::Database>, sqlx::Error>>
    where
        'c: 'e,
    {
        match self {
            PgConn::Txn(txn) => (&mut **txn).describe(sql),
            PgConn::Oneshot(pool) => (&*pool).describe(sql),
        }
    }
}

#[async_trait]
impl Transaction for PostgresTxn {
    async fn commit(self: Box<Self>) -> Result<()> {
        match self.inner {
            PgConn::Txn(txn) => txn
                .commit()
                .await
                .map_err(|e| Error::SqlxError { source: e }),
            // nothing is pending on a oneshot connection
            PgConn::Oneshot(_) => Ok(()),
        }
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        match self.inner {
            PgConn::Txn(txn) => txn
                .rollback()
                .await
                .map_err(|e| Error::SqlxError { source: e }),
            PgConn::Oneshot(_) => Ok(()),
        }
    }
}

impl RepoCollection for PostgresTxn {
    fn instance_statuses(&mut self) -> &mut dyn InstanceStatusRepo {
        self
    }

    fn raw_files(&mut self) -> &mut dyn RawFileMetadataRepo {
        self
    }

    fn materialization_jobs(&mut self) -> &mut dyn MaterializationJobRepo {
        self
    }
}

fn invalid_row(table: &'static str, message: impl Display) -> Error {
    Error::InvalidRow {
        table,
        message: message.to_string(),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(inner) = e {
        if let Some(code) = inner.code() {
            if code == "23505" {
                // Unique violation
                return true;
            }
        }
    }
    false
}

fn is_check_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(inner) if inner.code().as_deref() == Some("23514"))
}

const STATUS_TABLE: &str = "direct_ingest_instance_status";

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    region_code: String,
    instance: String,
    status: String,
    status_timestamp: DateTime<Utc>,
}

impl TryFrom<StatusRow> for DirectIngestInstanceStatus {
    type Error = Error;

    fn try_from(row: StatusRow) -> Result<Self> {
        Ok(Self {
            region_code: StateCode::new(&row.region_code)
                .map_err(|e| invalid_row(STATUS_TABLE, e))?,
            instance: row
                .instance
                .parse()
                .map_err(|e| invalid_row(STATUS_TABLE, e))?,
            status: row.status.parse().map_err(|e| invalid_row(STATUS_TABLE, e))?,
            status_timestamp: row.status_timestamp,
        })
    }
}

fn statuses(rows: Vec<StatusRow>) -> Result<Vec<DirectIngestInstanceStatus>> {
    rows.into_iter().map(TryFrom::try_from).collect()
}

#[async_trait]
impl InstanceStatusRepo for PostgresTxn {
    async fn create(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        status: DirectIngestStatus,
        status_timestamp: DateTime<Utc>,
    ) -> Result<DirectIngestInstanceStatus> {
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
INSERT INTO direct_ingest_instance_status ( region_code, instance, status, status_timestamp )
VALUES ( $1, $2, $3, $4 )
RETURNING region_code, instance, status, status_timestamp;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .bind(status.as_str()) // $3
        .bind(status_timestamp) // $4
        .fetch_one(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        row.try_into()
    }

    async fn get_current(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Option<DirectIngestInstanceStatus>> {
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
SELECT region_code, instance, status, status_timestamp
FROM direct_ingest_instance_status
WHERE region_code = $1 AND instance = $2
ORDER BY status_timestamp DESC
LIMIT 1;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .fetch_optional(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_history(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<DirectIngestInstanceStatus>> {
        let rows = sqlx::query_as::<_, StatusRow>(
            r#"
SELECT region_code, instance, status, status_timestamp
FROM direct_ingest_instance_status
WHERE region_code = $1 AND instance = $2
ORDER BY status_timestamp;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .fetch_all(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        statuses(rows)
    }

    async fn list_current(&mut self) -> Result<Vec<DirectIngestInstanceStatus>> {
        let rows = sqlx::query_as::<_, StatusRow>(
            r#"
SELECT DISTINCT ON (region_code, instance) region_code, instance, status, status_timestamp
FROM direct_ingest_instance_status
ORDER BY region_code, instance, status_timestamp DESC;
            "#,
        )
        .fetch_all(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        statuses(rows)
    }
}

const RAW_FILE_TABLE: &str = "direct_ingest_raw_file_metadata";

#[derive(Debug, sqlx::FromRow)]
struct RawFileRow {
    file_id: i64,
    region_code: String,
    raw_data_instance: String,
    file_tag: String,
    normalized_file_name: String,
    update_datetime: DateTime<Utc>,
    file_discovery_time: DateTime<Utc>,
    file_processed_time: Option<DateTime<Utc>>,
    is_invalidated: bool,
}

impl TryFrom<RawFileRow> for RawFileMetadata {
    type Error = Error;

    fn try_from(row: RawFileRow) -> Result<Self> {
        Ok(Self {
            file_id: RawFileId::new(row.file_id),
            region_code: StateCode::new(&row.region_code)
                .map_err(|e| invalid_row(RAW_FILE_TABLE, e))?,
            file_tag: row.file_tag,
            raw_data_instance: row
                .raw_data_instance
                .parse()
                .map_err(|e| invalid_row(RAW_FILE_TABLE, e))?,
            normalized_file_name: row.normalized_file_name,
            update_datetime: row.update_datetime,
            file_discovery_time: row.file_discovery_time,
            file_processed_time: row.file_processed_time,
            is_invalidated: row.is_invalidated,
        })
    }
}

fn raw_files(rows: Vec<RawFileRow>) -> Result<Vec<RawFileMetadata>> {
    rows.into_iter().map(TryFrom::try_from).collect()
}

#[async_trait]
impl RawFileMetadataRepo for PostgresTxn {
    async fn create(&mut self, params: &RawFileMetadataParams) -> Result<RawFileMetadata> {
        let row = sqlx::query_as::<_, RawFileRow>(
            r#"
INSERT INTO direct_ingest_raw_file_metadata (
    region_code, raw_data_instance, file_tag, normalized_file_name, update_datetime,
    file_discovery_time
)
VALUES ( $1, $2, $3, $4, $5, $6 )
RETURNING *;
            "#,
        )
        .bind(params.region_code.as_str()) // $1
        .bind(params.raw_data_instance.as_str()) // $2
        .bind(&params.file_tag) // $3
        .bind(&params.normalized_file_name) // $4
        .bind(params.update_datetime) // $5
        .bind(params.file_discovery_time) // $6
        .fetch_one(&mut self.inner)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::RawFileExists {
                    region_code: params.region_code.clone(),
                    instance: params.raw_data_instance,
                    normalized_file_name: params.normalized_file_name.clone(),
                }
            } else {
                Error::SqlxError { source: e }
            }
        })?;

        row.try_into()
    }

    async fn get_by_normalized_file_name(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: &str,
    ) -> Result<Option<RawFileMetadata>> {
        let row = sqlx::query_as::<_, RawFileRow>(
            r#"
SELECT *
FROM direct_ingest_raw_file_metadata
WHERE region_code = $1 AND raw_data_instance = $2 AND normalized_file_name = $3
    AND is_invalidated = FALSE;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .bind(normalized_file_name) // $3
        .fetch_optional(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        row.map(TryInto::try_into).transpose()
    }

    async fn mark_processed(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: &str,
        file_processed_time: DateTime<Utc>,
    ) -> Result<RawFileMetadata> {
        let row = sqlx::query_as::<_, RawFileRow>(
            r#"
UPDATE direct_ingest_raw_file_metadata
SET file_processed_time = $4
WHERE region_code = $1 AND raw_data_instance = $2 AND normalized_file_name = $3
    AND is_invalidated = FALSE
RETURNING *;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .bind(normalized_file_name) // $3
        .bind(file_processed_time) // $4
        .fetch_optional(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        match row {
            Some(row) => row.try_into(),
            None => Err(Error::RawFileNotFound {
                region_code: region_code.clone(),
                instance,
                normalized_file_name: normalized_file_name.to_string(),
            }),
        }
    }

    async fn list(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<RawFileMetadata>> {
        let rows = sqlx::query_as::<_, RawFileRow>(
            r#"
SELECT *
FROM direct_ingest_raw_file_metadata
WHERE region_code = $1 AND raw_data_instance = $2 AND is_invalidated = FALSE
ORDER BY update_datetime, file_id;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .fetch_all(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        raw_files(rows)
    }

    async fn list_discovered_after(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        file_tag: &str,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawFileMetadata>> {
        let rows = sqlx::query_as::<_, RawFileRow>(
            r#"
SELECT *
FROM direct_ingest_raw_file_metadata
WHERE region_code = $1 AND raw_data_instance = $2 AND file_tag = $3
    AND is_invalidated = FALSE
    AND ($4::TIMESTAMPTZ IS NULL OR file_discovery_time > $4)
ORDER BY update_datetime, file_id;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .bind(file_tag) // $3
        .bind(cutoff) // $4
        .fetch_all(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        raw_files(rows)
    }

    async fn invalidate_all(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
UPDATE direct_ingest_raw_file_metadata
SET is_invalidated = TRUE
WHERE region_code = $1 AND raw_data_instance = $2 AND is_invalidated = FALSE;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .execute(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        Ok(result.rows_affected())
    }

    async fn transfer(
        &mut self,
        region_code: &StateCode,
        from: DirectIngestInstance,
        to: DirectIngestInstance,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
UPDATE direct_ingest_raw_file_metadata
SET raw_data_instance = $3
WHERE region_code = $1 AND raw_data_instance = $2 AND is_invalidated = FALSE;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(from.as_str()) // $2
        .bind(to.as_str()) // $3
        .execute(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        Ok(result.rows_affected())
    }
}

const JOB_TABLE: &str = "direct_ingest_view_materialization_metadata";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    region_code: String,
    instance: String,
    ingest_view_name: String,
    lower_bound_datetime_exclusive: Option<DateTime<Utc>>,
    upper_bound_datetime_inclusive: DateTime<Utc>,
    job_creation_time: DateTime<Utc>,
    materialization_time: Option<DateTime<Utc>>,
    is_invalidated: bool,
}

impl TryFrom<JobRow> for IngestViewMaterializationMetadata {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            region_code: StateCode::new(&row.region_code).map_err(|e| invalid_row(JOB_TABLE, e))?,
            instance: row.instance.parse().map_err(|e| invalid_row(JOB_TABLE, e))?,
            ingest_view_name: row.ingest_view_name,
            lower_bound_datetime_exclusive: row.lower_bound_datetime_exclusive,
            upper_bound_datetime_inclusive: row.upper_bound_datetime_inclusive,
            job_creation_time: row.job_creation_time,
            materialization_time: row.materialization_time,
            is_invalidated: row.is_invalidated,
        })
    }
}

fn jobs(rows: Vec<JobRow>) -> Result<Vec<IngestViewMaterializationMetadata>> {
    rows.into_iter().map(TryFrom::try_from).collect()
}

#[async_trait]
impl MaterializationJobRepo for PostgresTxn {
    async fn create(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
        job_creation_time: DateTime<Utc>,
    ) -> Result<IngestViewMaterializationMetadata> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
INSERT INTO direct_ingest_view_materialization_metadata (
    region_code, instance, ingest_view_name, lower_bound_datetime_exclusive,
    upper_bound_datetime_inclusive, job_creation_time
)
VALUES ( $1, $2, $3, $4, $5, $6 )
RETURNING *;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(args.ingest_instance.as_str()) // $2
        .bind(&args.ingest_view_name) // $3
        .bind(args.lower_bound_datetime_exclusive) // $4
        .bind(args.upper_bound_datetime_inclusive) // $5
        .bind(job_creation_time) // $6
        .fetch_one(&mut self.inner)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::JobExists {
                    task_id: args.task_id_tag(),
                }
            } else if is_check_violation(&e) {
                Error::InvalidJobBounds {
                    task_id: args.task_id_tag(),
                }
            } else {
                Error::SqlxError { source: e }
            }
        })?;

        row.try_into()
    }

    async fn get(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
    ) -> Result<Option<IngestViewMaterializationMetadata>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
SELECT *
FROM direct_ingest_view_materialization_metadata
WHERE region_code = $1 AND instance = $2 AND ingest_view_name = $3
    AND lower_bound_datetime_exclusive IS NOT DISTINCT FROM $4
    AND upper_bound_datetime_inclusive = $5
    AND is_invalidated = FALSE;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(args.ingest_instance.as_str()) // $2
        .bind(&args.ingest_view_name) // $3
        .bind(args.lower_bound_datetime_exclusive) // $4
        .bind(args.upper_bound_datetime_inclusive) // $5
        .fetch_optional(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_most_recent(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        ingest_view_name: &str,
    ) -> Result<Option<IngestViewMaterializationMetadata>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
SELECT *
FROM direct_ingest_view_materialization_metadata
WHERE region_code = $1 AND instance = $2 AND ingest_view_name = $3
    AND is_invalidated = FALSE
ORDER BY upper_bound_datetime_inclusive DESC
LIMIT 1;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .bind(ingest_view_name) // $3
        .fetch_optional(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        row.map(TryInto::try_into).transpose()
    }

    async fn mark_materialized(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
        materialization_time: DateTime<Utc>,
    ) -> Result<IngestViewMaterializationMetadata> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
UPDATE direct_ingest_view_materialization_metadata
SET materialization_time = $6
WHERE region_code = $1 AND instance = $2 AND ingest_view_name = $3
    AND lower_bound_datetime_exclusive IS NOT DISTINCT FROM $4
    AND upper_bound_datetime_inclusive = $5
    AND is_invalidated = FALSE
RETURNING *;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(args.ingest_instance.as_str()) // $2
        .bind(&args.ingest_view_name) // $3
        .bind(args.lower_bound_datetime_exclusive) // $4
        .bind(args.upper_bound_datetime_inclusive) // $5
        .bind(materialization_time) // $6
        .fetch_optional(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        match row {
            Some(row) => row.try_into(),
            None => Err(Error::JobNotFound {
                task_id: args.task_id_tag(),
            }),
        }
    }

    async fn list(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<IngestViewMaterializationMetadata>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
SELECT *
FROM direct_ingest_view_materialization_metadata
WHERE region_code = $1 AND instance = $2 AND is_invalidated = FALSE
ORDER BY ingest_view_name, upper_bound_datetime_inclusive;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .fetch_all(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        jobs(rows)
    }

    async fn invalidate_all(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
UPDATE direct_ingest_view_materialization_metadata
SET is_invalidated = TRUE
WHERE region_code = $1 AND instance = $2 AND is_invalidated = FALSE;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(instance.as_str()) // $2
        .execute(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        Ok(result.rows_affected())
    }

    async fn transfer(
        &mut self,
        region_code: &StateCode,
        from: DirectIngestInstance,
        to: DirectIngestInstance,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
UPDATE direct_ingest_view_materialization_metadata
SET instance = $3
WHERE region_code = $1 AND instance = $2 AND is_invalidated = FALSE;
            "#,
        )
        .bind(region_code.as_str()) // $1
        .bind(from.as_str()) // $2
        .bind(to.as_str()) // $3
        .execute(&mut self.inner)
        .await
        .map_err(|e| Error::SqlxError { source: e })?;

        Ok(result.rows_affected())
    }
}

/// Test helpers postgres testing.
#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use rand::Rng;
    use sqlx::migrate::MigrateDatabase;

    pub(crate) const TEST_DSN_ENV: &str = "TEST_DIRECT_INGEST_CATALOG_DSN";

    /// Helper macro to skip tests if TEST_INTEGRATION and TEST_DIRECT_INGEST_CATALOG_DSN
    /// environment variables are not set.
    macro_rules! maybe_skip_integration {
        () => {{
            dotenvy::dotenv().ok();

            let dsn_set = std::env::var(crate::postgres::test_utils::TEST_DSN_ENV).is_ok();
            let force = std::env::var("TEST_INTEGRATION").is_ok();

            if force && !dsn_set {
                panic!(
                    "TEST_INTEGRATION is set, but variable(s) {} need to be set",
                    crate::postgres::test_utils::TEST_DSN_ENV
                );
            } else if !force {
                eprintln!(
                    "skipping Postgres integration test - set {}TEST_INTEGRATION to run",
                    if dsn_set {
                        String::new()
                    } else {
                        format!("{} and ", crate::postgres::test_utils::TEST_DSN_ENV)
                    }
                );
                return;
            }
        }};
    }

    pub(crate) use maybe_skip_integration;

    pub(crate) async fn create_db(dsn: &str) {
        if !Postgres::database_exists(dsn).await.unwrap() {
            // Ignore failure if another test has already created the database
            let _ = Postgres::create_database(dsn).await;
        }
    }

    pub(crate) async fn setup_db_no_migration() -> PostgresCatalog {
        // random schema per test so tests can run in parallel
        let schema_name = {
            let mut rng = rand::thread_rng();
            (&mut rng)
                .sample_iter(rand::distributions::Alphanumeric)
                .filter(|c| c.is_ascii_alphabetic())
                .take(20)
                .map(char::from)
                .collect::<String>()
        };

        let dsn = std::env::var(TEST_DSN_ENV).unwrap();
        create_db(&dsn).await;

        let options = PostgresConnectionOptions {
            app_name: String::from("test"),
            schema_name: schema_name.clone(),
            dsn,
            max_conns: 3,
            ..Default::default()
        };
        let pg = PostgresCatalog::connect(options)
            .await
            .expect("failed to connect catalog");

        pg.pool
            .execute(format!("CREATE SCHEMA {schema_name};").as_str())
            .await
            .expect("failed to create test schema");

        pg
    }

    pub(crate) async fn setup_db() -> PostgresCatalog {
        let pg = setup_db_no_migration().await;
        pg.setup().await.expect("failed to initialise database");
        pg
    }
}

//! SQL rendering for ingest view materialization.
//!
//! An ingest view is evaluated as of a single point in time: every raw table it
//! reads is replaced by a snapshot of that table as of the bound, then the view
//! query runs over the snapshots. The diff between the upper and lower bound
//! snapshots is what a materialization job saves.

use chrono::{DateTime, Timelike, Utc};
use direct_ingest_types::{
    IngestViewMaterializationArgs,
    region::{IngestViewDefinition, RawFileConfig},
};
use std::fmt::{Display, Write};

/// Suffix given to the per raw table subqueries.
const GENERATED_VIEW_SUFFIX: &str = "_generated_view";

/// A `DATETIME` literal. Microseconds are omitted when zero.
pub fn datetime_literal(dt: DateTime<Utc>) -> String {
    let fmt = if dt.nanosecond() / 1_000 == 0 {
        "%Y-%m-%dT%H:%M:%S"
    } else {
        "%Y-%m-%dT%H:%M:%S%.6f"
    };
    format!("DATETIME \"{}\"", dt.format(fmt))
}

/// Fully qualified warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }
}

impl Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "`{}.{}.{}`",
            self.project_id, self.dataset_id, self.table_id
        )
    }
}

/// Which bound of a job a snapshot is taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundType {
    Upper,
    Lower,
}

impl BoundType {
    fn table_label(&self) -> &'static str {
        match self {
            Self::Upper => "upper_bound",
            Self::Lower => "lower_bound",
        }
    }

    fn debug_prefix(&self) -> &'static str {
        match self {
            Self::Upper => "upper_",
            Self::Lower => "lower_",
        }
    }
}

/// Name of the temp table holding a view snapshot, e.g.
/// `ingest_view_2020_07_20_01_02_03_upper_bound_abcd1234`.
pub fn temp_table_name(
    ingest_view_name: &str,
    bound: DateTime<Utc>,
    bound_type: BoundType,
    suffix: &str,
) -> String {
    format!(
        "{ingest_view_name}_{}_{}_{suffix}",
        bound.format("%Y_%m_%d_%H_%M_%S"),
        bound_type.table_label()
    )
}

/// The query for one ingest view as of `bound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSnapshotQuery {
    pub project_id: String,
    /// Dataset the raw tables are read from.
    pub raw_data_dataset: String,
    pub view: IngestViewDefinition,
    /// Configs of the raw tables the view reads, in order of first reference.
    pub raw_tables: Vec<RawFileConfig>,
    pub bound: DateTime<Utc>,
}

impl ViewSnapshotQuery {
    fn raw_table(&self, config: &RawFileConfig) -> TableRef {
        TableRef::new(&self.project_id, &self.raw_data_dataset, &config.file_tag)
    }

    /// Snapshot of one raw table, indented for use as a CTE body.
    pub fn raw_table_query(&self, config: &RawFileConfig) -> String {
        let table = self.raw_table(config);
        let bound = datetime_literal(self.bound);
        let columns = config.columns.join(", ");
        if config.always_historical_export {
            format!(
                "    WITH max_update_datetime AS (
        SELECT
            MAX(update_datetime) AS update_datetime
        FROM
            {table}
        WHERE update_datetime <= {bound}
    ),
    max_file_id AS (
        SELECT
            MAX(file_id) AS file_id
        FROM
            {table}
        WHERE
            update_datetime = (SELECT update_datetime FROM max_update_datetime)
    ),
    filtered_rows AS (
        SELECT *
        FROM
            {table}
        WHERE
            file_id = (SELECT file_id FROM max_file_id)
    )
    SELECT {columns}
    FROM filtered_rows"
            )
        } else {
            let primary_keys = config.primary_keys.join(", ");
            format!(
                "    WITH filtered_rows AS (
        SELECT
            * EXCEPT (recency_rank)
        FROM (
            SELECT
                *,
                ROW_NUMBER() OVER (PARTITION BY {primary_keys}
                                   ORDER BY update_datetime DESC) AS recency_rank
            FROM
                {table}
            WHERE update_datetime <= {bound}
        ) a
        WHERE
            recency_rank = 1
            AND is_deleted = False
    )
    SELECT {columns}
    FROM filtered_rows"
            )
        }
    }

    fn ordered_view_query(&self, raw_table_prefix: &str) -> String {
        let rendered = self
            .view
            .render_query(|tag| format!("{raw_table_prefix}{tag}{GENERATED_VIEW_SUFFIX}"));
        format!("{rendered}\nORDER BY {}", self.view.order_by_cols_str())
    }

    /// The view query with every raw table inlined as a CTE.
    pub fn inline_query(&self) -> String {
        let ctes = self
            .raw_tables
            .iter()
            .map(|config| {
                format!(
                    "{}{GENERATED_VIEW_SUFFIX} AS (\n{}\n)",
                    config.file_tag,
                    self.raw_table_query(config)
                )
            })
            .collect::<Vec<_>>()
            .join(",\n");
        format!("WITH\n{ctes}\n{}", self.ordered_view_query(""))
    }

    /// `CREATE TEMP TABLE` statements for each raw table snapshot.
    fn raw_temp_table_statements(&self, raw_table_prefix: &str) -> String {
        let mut out = String::new();
        for config in &self.raw_tables {
            // writing to a String cannot fail
            let _ = writeln!(
                out,
                "CREATE TEMP TABLE {raw_table_prefix}{}{GENERATED_VIEW_SUFFIX} AS (\n{}\n);",
                config.file_tag,
                self.raw_table_query(config)
            );
        }
        out
    }

    /// Script that (re)creates `destination` with the view contents as of the
    /// bound. The table expires after a day.
    pub fn create_table_sql(&self, destination: &TableRef) -> String {
        let (prelude, query) = if self.view.materialize_raw_data_table_views {
            (self.raw_temp_table_statements(""), self.ordered_view_query(""))
        } else {
            (String::new(), self.inline_query())
        };
        format!(
            "{prelude}DROP TABLE IF EXISTS {destination};
CREATE TABLE {destination}
OPTIONS(
  -- Data in this table will be deleted after 24 hours
  expiration_timestamp=TIMESTAMP_ADD(CURRENT_TIMESTAMP(), INTERVAL 1 DAY)
) AS (

{query}

);"
        )
    }

    /// Same computation as [`Self::create_table_sql`] written into a script
    /// local temp table, for operators debugging a job by hand.
    fn debug_sql(&self, table_name: &str, bound_type: BoundType) -> String {
        if self.view.materialize_raw_data_table_views {
            let prefix = bound_type.debug_prefix();
            format!(
                "{}CREATE TEMP TABLE {table_name} AS (\n{}\n);",
                self.raw_temp_table_statements(prefix),
                self.ordered_view_query(prefix)
            )
        } else {
            format!(
                "CREATE TEMP TABLE {table_name} AS (\n{}\n);",
                self.inline_query()
            )
        }
    }
}

/// Rows of the upper bound snapshot that are not in the lower bound snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffQuery {
    pub upper_bound_table: TableRef,
    pub lower_bound_table: Option<TableRef>,
    pub order_by_columns: Vec<String>,
}

impl DiffQuery {
    /// The diff as a statement without trailing semicolon.
    pub fn select_sql(&self) -> String {
        diff_select(
            &self.upper_bound_table.to_string(),
            self.lower_bound_table.as_ref().map(ToString::to_string).as_deref(),
            &self.order_by_columns.join(", "),
        )
    }

    pub fn to_sql(&self) -> String {
        format!("{};", self.select_sql())
    }
}

fn diff_select(upper: &str, lower: Option<&str>, order_by: &str) -> String {
    match lower {
        Some(lower) => format!(
            "(\nSELECT * FROM {upper}\n) EXCEPT DISTINCT (\nSELECT * FROM {lower}\n)\nORDER BY {order_by}"
        ),
        None => format!("SELECT * FROM {upper}\nORDER BY {order_by}"),
    }
}

/// Renders the full computation for `args` as a single script of temp tables.
pub fn debug_query_for_args(
    upper: &ViewSnapshotQuery,
    lower: Option<&ViewSnapshotQuery>,
    args: &IngestViewMaterializationArgs,
    suffix: &str,
) -> String {
    let upper_table = temp_table_name(
        &args.ingest_view_name,
        args.upper_bound_datetime_inclusive,
        BoundType::Upper,
        suffix,
    );
    let mut statements = vec![upper.debug_sql(&upper_table, BoundType::Upper)];

    let lower_table = match (lower, args.lower_bound_datetime_exclusive) {
        (Some(lower), Some(bound)) => {
            let name = temp_table_name(&args.ingest_view_name, bound, BoundType::Lower, suffix);
            statements.push(lower.debug_sql(&name, BoundType::Lower));
            Some(name)
        }
        _ => None,
    };

    statements.push(format!(
        "{};",
        diff_select(
            &upper_table,
            lower_table.as_deref(),
            &upper.view.order_by_cols_str()
        )
    ));
    statements.join("\n")
}

/// Column names added to every saved ingest view result row.
pub mod columns {
    pub const UPPER_BOUND_DATETIME_INCLUSIVE: &str = "__upper_bound_datetime_inclusive";
    pub const LOWER_BOUND_DATETIME_EXCLUSIVE: &str = "__lower_bound_datetime_exclusive";
    pub const BATCH_NUMBER: &str = "__batch_number";
    pub const PROCESSED: &str = "__processed";
}

/// Appends the result of a [`DiffQuery`] to an ingest view results table,
/// replacing rows previously saved for the same upper bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffInsert {
    pub diff: DiffQuery,
    pub destination: TableRef,
    pub upper_bound_datetime_inclusive: DateTime<Utc>,
    pub lower_bound_datetime_exclusive: Option<DateTime<Utc>>,
    pub batch_size: usize,
}

impl DiffInsert {
    fn select_sql(&self) -> String {
        let lower = match self.lower_bound_datetime_exclusive {
            Some(lower) => datetime_literal(lower),
            None => "CAST(NULL AS DATETIME)".to_string(),
        };
        format!(
            "SELECT
    *,
    {upper} AS {upper_col},
    {lower} AS {lower_col},
    CAST(FLOOR((ROW_NUMBER() OVER (ORDER BY {order_by}) - 1) / {batch_size}) AS INT64) AS {batch_col},
    FALSE AS {processed_col}
FROM (
{diff}
)",
            upper = datetime_literal(self.upper_bound_datetime_inclusive),
            upper_col = columns::UPPER_BOUND_DATETIME_INCLUSIVE,
            lower_col = columns::LOWER_BOUND_DATETIME_EXCLUSIVE,
            order_by = self.diff.order_by_columns.join(", "),
            batch_size = self.batch_size,
            batch_col = columns::BATCH_NUMBER,
            processed_col = columns::PROCESSED,
            diff = self.diff.select_sql(),
        )
    }

    /// Script for the insert; the destination is created when it does not
    /// exist yet.
    pub fn to_sql(&self, destination_exists: bool) -> String {
        let destination = &self.destination;
        if destination_exists {
            format!(
                "DELETE FROM {destination}\nWHERE {} = {};\nINSERT INTO {destination}\n{};",
                columns::UPPER_BOUND_DATETIME_INCLUSIVE,
                datetime_literal(self.upper_bound_datetime_inclusive),
                self.select_sql()
            )
        } else {
            format!(
                "CREATE TABLE {destination} AS (\n{}\n);",
                self.select_sql()
            )
        }
    }
}

pub fn next_unprocessed_batch_sql(table: &TableRef) -> String {
    format!(
        "SELECT {upper}, {batch}\nFROM {table}\nWHERE NOT {processed}\nORDER BY {upper}, {batch}\nLIMIT 1;",
        upper = columns::UPPER_BOUND_DATETIME_INCLUSIVE,
        batch = columns::BATCH_NUMBER,
        processed = columns::PROCESSED,
    )
}

pub fn mark_batch_processed_sql(
    table: &TableRef,
    upper_bound_datetime_inclusive: DateTime<Utc>,
    batch_number: u64,
) -> String {
    format!(
        "UPDATE {table}\nSET {processed} = TRUE\nWHERE {upper} = {bound} AND {batch} = {batch_number};",
        processed = columns::PROCESSED,
        upper = columns::UPPER_BOUND_DATETIME_INCLUSIVE,
        bound = datetime_literal(upper_bound_datetime_inclusive),
        batch = columns::BATCH_NUMBER,
    )
}

pub fn results_table_counts_sql(table: &TableRef) -> String {
    format!(
        "SELECT
    COUNTIF({processed}) AS num_processed_rows,
    MAX(IF({processed}, {upper}, NULL)) AS processed_rows_max_datetime,
    COUNTIF(NOT {processed}) AS num_unprocessed_rows,
    MIN(IF(NOT {processed}, {upper}, NULL)) AS unprocessed_rows_min_datetime
FROM {table};",
        processed = columns::PROCESSED,
        upper = columns::UPPER_BOUND_DATETIME_INCLUSIVE,
    )
}

pub fn dataset_size_sql(project_id: &str, dataset_id: &str) -> String {
    format!("SELECT SUM(size_bytes) as total_bytes FROM `{project_id}.{dataset_id}.__TABLES__`")
}

/// Replaces `destination` with a copy of `source`.
pub fn copy_table_sql(source: &TableRef, destination: &TableRef) -> String {
    format!("CREATE OR REPLACE TABLE {destination} AS SELECT * FROM {source};")
}

//! CLI config for the data warehouse ingest views are materialized in.

use direct_ingest_materialization::{
    WarehouseClient,
    warehouse::{BigQueryClient, BigQueryConfig, MemWarehouse, bigquery::DEFAULT_BASE_URL},
};
use observability_deps::tracing::info;
use secrecy::{ExposeSecret, Secret};
use std::{sync::Arc, time::Duration};

#[derive(Debug, thiserror::Error)]
#[allow(missing_copy_implementations)]
pub enum Error {
    #[error("--warehouse-project-id is required for the {0:?} warehouse")]
    MissingProjectId(WarehouseType),
}

/// Warehouse type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum WarehouseType {
    /// In-memory warehouse. Data is lost when the process exits.
    Memory,

    /// Google BigQuery, over its REST API.
    Bigquery,
}

/// CLI config for the warehouse.
#[derive(Debug, Clone, clap::Parser)]
pub struct WarehouseConfig {
    /// Which warehouse to run ingest view queries in.
    #[clap(
        value_enum,
        long = "warehouse",
        env = "DIRECT_INGEST_WAREHOUSE",
        default_value = "memory",
        action
    )]
    pub warehouse: WarehouseType,

    /// Project that owns the raw data and ingest view results datasets.
    #[clap(
        long = "warehouse-project-id",
        env = "DIRECT_INGEST_WAREHOUSE_PROJECT_ID",
        action
    )]
    pub project_id: Option<String>,

    /// Base URL of the BigQuery REST API.
    #[clap(
        long = "bigquery-base-url",
        env = "DIRECT_INGEST_BIGQUERY_BASE_URL",
        default_value = DEFAULT_BASE_URL,
        action
    )]
    pub bigquery_base_url: String,

    /// OAuth access token for BigQuery.
    #[clap(long = "bigquery-access-token", env = "DIRECT_INGEST_BIGQUERY_ACCESS_TOKEN")]
    pub bigquery_access_token: Option<Secret<String>>,

    /// Location datasets are created and queries run in, e.g. `US`.
    #[clap(
        long = "bigquery-location",
        env = "DIRECT_INGEST_BIGQUERY_LOCATION",
        action
    )]
    pub bigquery_location: Option<String>,

    /// How often to poll a running BigQuery job.
    #[clap(
        long = "bigquery-poll-interval",
        env = "DIRECT_INGEST_BIGQUERY_POLL_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration,
    )]
    pub bigquery_poll_interval: Duration,
}

impl WarehouseConfig {
    pub fn make_warehouse(&self) -> Result<Arc<dyn WarehouseClient>, Error> {
        match self.warehouse {
            WarehouseType::Memory => {
                let project_id = self.project_id.as_deref().unwrap_or("local");
                info!(project_id, warehouse_type = "Memory", "Warehouse");
                Ok(Arc::new(MemWarehouse::new(project_id)))
            }
            WarehouseType::Bigquery => {
                let project_id = self
                    .project_id
                    .as_ref()
                    .ok_or(Error::MissingProjectId(WarehouseType::Bigquery))?;
                info!(
                    project_id,
                    base_url = %self.bigquery_base_url,
                    location = ?self.bigquery_location,
                    warehouse_type = "BigQuery",
                    "Warehouse"
                );
                let mut config = BigQueryConfig::new(project_id)
                    .with_base_url(&self.bigquery_base_url)
                    .with_poll_interval(self.bigquery_poll_interval);
                if let Some(token) = &self.bigquery_access_token {
                    config = config.with_access_token(token.expose_secret());
                }
                if let Some(location) = &self.bigquery_location {
                    config = config.with_location(location);
                }
                Ok(Arc::new(BigQueryClient::new(config)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn memory_warehouse_by_default() {
        let config = WarehouseConfig::try_parse_from([
            "server",
            "--warehouse-project-id",
            "recidiviz-staging",
        ])
        .unwrap();
        let warehouse = config.make_warehouse().unwrap();
        assert_eq!(warehouse.project_id(), "recidiviz-staging");
    }

    #[test]
    fn bigquery_needs_project() {
        let mut config =
            WarehouseConfig::try_parse_from(["server", "--warehouse", "bigquery"]).unwrap();
        config.project_id = None;
        let err = config.make_warehouse().unwrap_err();
        assert_eq!(
            err.to_string(),
            "--warehouse-project-id is required for the Bigquery warehouse"
        );
    }

    #[test]
    fn bigquery_options() {
        let config = WarehouseConfig::try_parse_from([
            "server",
            "--warehouse",
            "bigquery",
            "--warehouse-project-id",
            "recidiviz-123",
            "--bigquery-access-token",
            "hunter2",
            "--bigquery-poll-interval",
            "250ms",
        ])
        .unwrap();
        assert_eq!(
            config
                .bigquery_access_token
                .as_ref()
                .map(|t| t.expose_secret().as_str()),
            Some("hunter2")
        );
        assert_eq!(config.bigquery_poll_interval, Duration::from_millis(250));
        assert!(!format!("{config:?}").contains("hunter2"));

        let warehouse = config.make_warehouse().unwrap();
        assert_eq!(warehouse.project_id(), "recidiviz-123");
    }
}

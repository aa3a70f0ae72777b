//! [`WarehouseClient`] over the BigQuery REST API.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use observability_deps::tracing::{debug, info};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use url::Url;

use super::{Error, Result, WarehouseClient};
use crate::value::{Row, Value};

pub const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Connection settings for [`BigQueryClient`].
#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub base_url: String,
    pub project_id: String,
    /// OAuth access token sent as a `Bearer` token.
    pub access_token: Option<Secret<String>>,
    /// Location datasets are created in and jobs run in.
    pub location: Option<String>,
    /// Delay between polls of an unfinished query job.
    pub poll_interval: Duration,
}

impl BigQueryConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            project_id: project_id.into(),
            access_token: None,
            location: None,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(Secret::new(token.into()));
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BigQueryClient {
    config: BigQueryConfig,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: JobReference,
    #[serde(default)]
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    use_query_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableListEntry>,
    next_page_token: Option<String>,
}

fn convert_cell(field: &FieldSchema, cell: Cell) -> Result<Value> {
    let raw = match cell.v {
        serde_json::Value::Null => return Ok(Value::Null),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    let invalid = || {
        Error::InvalidResponse(format!(
            "cannot read {} value [{raw}] of column [{}]",
            field.field_type, field.name
        ))
    };
    match field.field_type.as_str() {
        "INTEGER" | "INT64" => raw.parse().map(Value::Int).map_err(|_| invalid()),
        "BOOLEAN" | "BOOL" => match raw.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        "DATETIME" => NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|dt| Value::DateTime(dt.and_utc()))
            .map_err(|_| invalid()),
        // seconds since the epoch in floating point notation
        "TIMESTAMP" => raw
            .parse::<f64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp_micros((secs * 1e6).round() as i64))
            .map(Value::DateTime)
            .ok_or_else(invalid),
        _ => Ok(Value::String(raw.clone())),
    }
}

fn convert_rows(schema: &TableSchema, rows: Vec<TableRow>) -> Result<Vec<Row>> {
    rows.into_iter()
        .map(|row| {
            if row.f.len() != schema.fields.len() {
                return Err(Error::InvalidResponse(format!(
                    "row has {} cells but the schema has {} fields",
                    row.f.len(),
                    schema.fields.len()
                )));
            }
            schema
                .fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| Ok((field.name.clone(), convert_cell(field, cell)?)))
                .collect()
        })
        .collect()
}

impl BigQueryClient {
    pub fn new(config: BigQueryConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/projects/{}/{path}",
            self.config.base_url.trim_end_matches('/'),
            self.config.project_id
        ))?)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder + Send,
    ) -> Result<Response> {
        let mut req = build(self.http_client.request(method.clone(), url.clone()));
        if let Some(token) = &self.config.access_token {
            req = req.bearer_auth(token.expose_secret());
        }
        req.send().await.map_err(|source| Error::RequestSend {
            method,
            url: url.to_string(),
            source,
        })
    }

    async fn api_error(resp: Response) -> Error {
        let code = resp.status();
        match resp.text().await {
            Ok(message) => Error::Api { code, message },
            Err(e) => Error::Response(e),
        }
    }

    async fn json<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T> {
        match resp.status() {
            StatusCode::OK => resp.json().await.map_err(Error::Response),
            _ => Err(Self::api_error(resp).await),
        }
    }

    async fn get_query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse> {
        let url = self.url(&format!("queries/{}", job.job_id))?;
        let mut params = vec![];
        if let Some(location) = job.location.as_deref().or(self.config.location.as_deref()) {
            params.push(("location", location.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        let resp = self
            .send(Method::GET, url, |req| req.query(&params))
            .await?;
        Self::json(resp).await
    }
}

#[async_trait]
impl WarehouseClient for BigQueryClient {
    fn project_id(&self) -> &str {
        &self.config.project_id
    }

    async fn run_query_async(&self, sql: &str, use_query_cache: bool) -> Result<Vec<Row>> {
        debug!(%sql, "running warehouse query");
        let body = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            use_query_cache,
            location: self.config.location.as_deref(),
        };
        let resp = self
            .send(Method::POST, self.url("queries")?, |req| req.json(&body))
            .await?;
        let mut page: QueryResponse = Self::json(resp).await?;

        while !page.job_complete {
            tokio::time::sleep(self.config.poll_interval).await;
            page = self.get_query_results(&page.job_reference, None).await?;
        }

        let schema = page.schema.take().unwrap_or_default();
        let mut rows = convert_rows(&schema, std::mem::take(&mut page.rows))?;
        while let Some(token) = page.page_token.take() {
            page = self
                .get_query_results(&page.job_reference, Some(&token))
                .await?;
            rows.extend(convert_rows(&schema, std::mem::take(&mut page.rows))?);
        }
        debug!(job_id = %page.job_reference.job_id, rows = rows.len(), "warehouse query done");
        Ok(rows)
    }

    async fn dataset_exists(&self, dataset_id: &str) -> Result<bool> {
        let resp = self
            .send(Method::GET, self.url(&format!("datasets/{dataset_id}"))?, |req| req)
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::api_error(resp).await),
        }
    }

    async fn create_dataset_if_necessary(
        &self,
        dataset_id: &str,
        default_table_expiration_ms: Option<u64>,
    ) -> Result<()> {
        let mut body = json!({
            "datasetReference": {
                "projectId": self.config.project_id,
                "datasetId": dataset_id,
            },
        });
        if let Some(ms) = default_table_expiration_ms {
            body["defaultTableExpirationMs"] = json!(ms.to_string());
        }
        if let Some(location) = &self.config.location {
            body["location"] = json!(location);
        }
        let resp = self
            .send(Method::POST, self.url("datasets")?, |req| req.json(&body))
            .await?;
        match resp.status() {
            StatusCode::OK => {
                info!(dataset_id, "created dataset");
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            _ => Err(Self::api_error(resp).await),
        }
    }

    async fn list_tables(&self, dataset_id: &str) -> Result<Vec<String>> {
        let url = self.url(&format!("datasets/{dataset_id}/tables"))?;
        let mut tables = vec![];
        let mut page_token: Option<String> = None;
        loop {
            let resp = self
                .send(Method::GET, url.clone(), |req| match &page_token {
                    Some(token) => req.query(&[("pageToken", token)]),
                    None => req,
                })
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(vec![]);
            }
            let page: TableList = Self::json(resp).await?;
            tables.extend(page.tables.into_iter().map(|t| t.table_reference.table_id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(tables),
            }
        }
    }

    async fn delete_table(&self, dataset_id: &str, table_id: &str) -> Result<()> {
        let url = self.url(&format!("datasets/{dataset_id}/tables/{table_id}"))?;
        let resp = self.send(Method::DELETE, url, |req| req).await?;
        match resp.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::api_error(resp).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    fn client(server: &mockito::Server) -> BigQueryClient {
        BigQueryClient::new(
            BigQueryConfig::new("recidiviz-456")
                .with_base_url(server.url())
                .with_access_token("token")
                .with_poll_interval(Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn query_polls_and_pages() {
        let mut server = mockito::Server::new_async().await;
        let schema = json!({"fields": [
            {"name": "id", "type": "INTEGER"},
            {"name": "name", "type": "STRING"},
            {"name": "done", "type": "BOOLEAN"},
            {"name": "at", "type": "DATETIME"},
        ]});

        let start = server
            .mock("POST", "/projects/recidiviz-456/queries")
            .match_header("Authorization", "Bearer token")
            .match_body(Matcher::Json(json!({
                "query": "SELECT 1",
                "useLegacySql": false,
                "useQueryCache": true,
            })))
            .with_status(200)
            .with_body(
                json!({"jobReference": {"jobId": "job1", "location": "US"}, "jobComplete": false})
                    .to_string(),
            )
            .create_async()
            .await;
        let first_page = server
            .mock("GET", "/projects/recidiviz-456/queries/job1")
            .match_query(Matcher::Exact("location=US".into()))
            .with_status(200)
            .with_body(
                json!({
                    "jobReference": {"jobId": "job1", "location": "US"},
                    "jobComplete": true,
                    "schema": schema,
                    "rows": [{"f": [{"v": "1"}, {"v": "a"}, {"v": "true"}, {"v": "2022-01-02T03:04:05"}]}],
                    "pageToken": "next",
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let second_page = server
            .mock("GET", "/projects/recidiviz-456/queries/job1")
            .match_query(Matcher::Exact("location=US&pageToken=next".into()))
            .with_status(200)
            .with_body(
                json!({
                    "jobReference": {"jobId": "job1", "location": "US"},
                    "jobComplete": true,
                    "schema": schema,
                    "rows": [{"f": [{"v": "2"}, {"v": null}, {"v": "false"}, {"v": null}]}],
                })
                .to_string(),
            )
            .create_async()
            .await;

        let rows = client(&server).run_query_async("SELECT 1", true).await.unwrap();
        start.assert_async().await;
        first_page.assert_async().await;
        second_page.assert_async().await;

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], Value::Int(1));
        assert_eq!(rows[0]["name"], Value::from("a"));
        assert_eq!(rows[0]["done"], Value::Bool(true));
        assert_eq!(
            rows[0]["at"],
            Value::DateTime(Utc.with_ymd_and_hms(2022, 1, 2, 3, 4, 5).unwrap())
        );
        assert_eq!(rows[1]["name"], Value::Null);
        assert_eq!(rows[1]["at"], Value::Null);
    }

    #[tokio::test]
    async fn query_errors_are_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/projects/recidiviz-456/queries")
            .with_status(400)
            .with_body("Syntax error")
            .create_async()
            .await;

        let err = client(&server)
            .run_query_async("SELEC 1", false)
            .await
            .unwrap_err();
        mock.assert_async().await;
        assert!(
            matches!(&err, Error::Api { code, message } if *code == StatusCode::BAD_REQUEST && message == "Syntax error"),
            "{err}"
        );
    }

    #[test]
    fn timestamp_cells() {
        let field = FieldSchema {
            name: "ts".to_string(),
            field_type: "TIMESTAMP".to_string(),
        };
        let value = convert_cell(&field, Cell { v: json!("1.6409952E9") }).unwrap();
        assert_eq!(
            value,
            Value::DateTime(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap())
        );
        assert!(convert_cell(&field, Cell { v: json!("soon") }).is_err());
    }

    #[tokio::test]
    async fn datasets() {
        let mut server = mockito::Server::new_async().await;
        let found = server
            .mock("GET", "/projects/recidiviz-456/datasets/us_xx_raw_data")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/projects/recidiviz-456/datasets/us_yy_raw_data")
            .with_status(404)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/projects/recidiviz-456/datasets")
            .match_body(Matcher::Json(json!({
                "datasetReference": {"projectId": "recidiviz-456", "datasetId": "us_xx_primary_temp_20220101"},
                "defaultTableExpirationMs": "86400000",
            })))
            .with_status(409)
            .with_body("Already Exists")
            .create_async()
            .await;

        let client = client(&server);
        assert!(client.dataset_exists("us_xx_raw_data").await.unwrap());
        assert!(!client.dataset_exists("us_yy_raw_data").await.unwrap());
        client
            .create_dataset_if_necessary("us_xx_primary_temp_20220101", Some(86_400_000))
            .await
            .unwrap();
        found.assert_async().await;
        missing.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn tables() {
        let mut server = mockito::Server::new_async().await;
        let path = "/projects/recidiviz-456/datasets/temp/tables";
        let first = server
            .mock("GET", path)
            .match_query(Matcher::Missing)
            .with_status(200)
            .expect(2)
            .with_body(
                json!({"tables": [{"tableReference": {"tableId": "a"}}], "nextPageToken": "p2"})
                    .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", path)
            .match_query(Matcher::Exact("pageToken=p2".into()))
            .with_status(200)
            .expect(2)
            .with_body(json!({"tables": [{"tableReference": {"tableId": "b"}}]}).to_string())
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/projects/recidiviz-456/datasets/temp/tables/a")
            .with_status(404)
            .create_async()
            .await;

        let client = client(&server);
        assert_eq!(
            client.list_tables("temp").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(client.table_exists("temp", "b").await.unwrap());
        client.delete_table("temp", "a").await.unwrap();
        first.assert_async().await;
        second.assert_async().await;
        delete.assert_async().await;
    }
}

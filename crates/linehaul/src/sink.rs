// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination for assembled batches.
//!
//! [`Sink`] is the seam the retrying sender talks to; [`BigQuerySink`] implements it on top of the
//! BigQuery streaming `insertAll` API.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::batch::BatchRecord;
use crate::errors::{ConfigError, SinkError};

pub const DEFAULT_BIGQUERY_URL: &str = "https://bigquery.googleapis.com";
const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 10;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Inserts rows into `table`, routed to the table named by `template_suffix`.
    async fn insert_all(
        &self,
        table: &TableRef,
        template_suffix: &str,
        rows: &[BatchRecord],
    ) -> Result<(), SinkError>;
}

/// Fully qualified table name, `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl FromStr for TableRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        match parts.as_slice() {
            [project, dataset, table]
                if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
            {
                Ok(Self {
                    project: (*project).to_string(),
                    dataset: (*dataset).to_string(),
                    table: (*table).to_string(),
                })
            }
            _ => Err(ConfigError::Table(s.to_string())),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

pub struct BigQueryConfig {
    /// OAuth2 bearer token sent with every request.
    pub access_token: String,
    /// API root, overridable for tests (e.g., a local mock server).
    pub base_url: String,
    pub https_proxy: Option<String>,
    /// How many idle connections to the API the pool keeps open. Requests in flight are not capped.
    pub max_idle_connections: usize,
}

impl BigQueryConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            base_url: DEFAULT_BIGQUERY_URL.to_string(),
            https_proxy: None,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    kind: &'static str,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    template_suffix: &'a str,
    rows: &'a [BatchRecord],
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<Value>,
}

#[derive(Clone)]
pub struct BigQuerySink {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl BigQuerySink {
    pub fn new(config: BigQueryConfig) -> Result<Self, reqwest::Error> {
        let mut builder =
            reqwest::Client::builder().pool_max_idle_per_host(config.max_idle_connections);
        if let Some(proxy) = config.https_proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
        })
    }

    fn insert_all_url(&self, table: &TableRef) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.base_url, table.project, table.dataset, table.table
        )
    }
}

#[async_trait]
impl Sink for BigQuerySink {
    async fn insert_all(
        &self,
        table: &TableRef,
        template_suffix: &str,
        rows: &[BatchRecord],
    ) -> Result<(), SinkError> {
        let request = InsertAllRequest {
            kind: "bigquery#tableDataInsertAllRequest",
            skip_invalid_rows: true,
            ignore_unknown_values: true,
            template_suffix,
            rows,
        };
        let body =
            serde_json::to_vec(&request).map_err(|e| SinkError::Serialization(e.to_string()))?;

        let resp = self
            .client
            .post(self.insert_all_url(table))
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let payload = resp.bytes().await?;
        if !status.is_success() {
            return Err(SinkError::Status {
                status,
                body: String::from_utf8_lossy(&payload).into_owned(),
            });
        }

        let parsed: InsertAllResponse = match serde_json::from_slice(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(
                    "Unparseable {} response from {}{} ({}); treating it as accepted",
                    status, table, template_suffix, e
                );
                InsertAllResponse::default()
            }
        };
        if !parsed.insert_errors.is_empty() {
            return Err(SinkError::InsertErrors {
                count: parsed.insert_errors.len(),
            });
        }

        debug!(
            "Inserted {} rows into {}{}",
            rows.len(),
            table,
            template_suffix
        );
        Ok(())
    }
}

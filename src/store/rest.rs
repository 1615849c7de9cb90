//! REST backend for a Postgres service exposing a PostgREST-style API.
//!
//! Each collection is a table under `/rest/v1/<table>` with the same layout
//! as the SQLite backend (`id`, `code`, `data` jsonb, timestamps). Filters
//! become `data->>field=op.value` query parameters, numeric ranges and
//! ordering go through `data->field` so jsonb compares numbers as numbers,
//! and codes are drawn from the `next_entity_code` RPC.

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Collection, Filter, Op, RowMeta, SortDirection, Store};
use crate::error::{AppError, AppResult};

const NEXT_CODE_RPC: &str = "next_entity_code";

pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn table_url(&self, collection: Collection) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection.as_str())
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{function}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn send(&self, request: RequestBuilder, context: &str) -> AppResult<Response> {
        let resp = self.authorized(request).send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        warn!(%status, context, "REST store request failed");
        Err(status_error(status, context, body.trim()))
    }

    fn rows(resp: Response) -> AppResult<Vec<Value>> {
        let body = resp.text()?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body)? {
            Value::Array(rows) => Ok(rows),
            other => Ok(vec![other]),
        }
    }
}

/// Convert an HTTP status into an error, keeping the response body for
/// diagnostics.
fn status_error(status: StatusCode, context: &str, body: &str) -> AppError {
    let detail = if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    };
    match status.as_u16() {
        409 => AppError::Conflict(format!("{context} (HTTP 409){detail}")),
        401 | 403 => AppError::Http(format!(
            "{context}: API key rejected (HTTP {}){detail}",
            status.as_u16()
        )),
        s => AppError::Http(format!("{context} (HTTP {s}){detail}")),
    }
}

fn row_body(doc: &Value) -> AppResult<Value> {
    let meta = RowMeta::from_doc(doc)?;
    Ok(serde_json::json!({
        "id": meta.id,
        "code": meta.code,
        "data": doc,
        "created_at": meta.created_at,
        "updated_at": meta.updated_at,
        "deleted_at": meta.deleted_at,
    }))
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Quote list members that would break the `in.(...)` syntax.
fn list_member(value: &Value) -> String {
    let raw = literal(value);
    if raw.contains([',', '(', ')', '"']) {
        format!("\"{}\"", raw.replace('"', "\\\""))
    } else {
        raw
    }
}

/// Column expression for a condition. `code` has its own integer column;
/// numeric ranges stay jsonb, everything else compares as text.
fn condition_column(field: &str, op: Op, value: &Value) -> String {
    let range = matches!(op, Op::Gt | Op::Gte | Op::Lt | Op::Lte);
    if field == "code" {
        "code".to_string()
    } else if range && value.is_number() {
        format!("data->{field}")
    } else {
        format!("data->>{field}")
    }
}

fn order_column(field: &str) -> String {
    if field == "code" {
        "code".to_string()
    } else {
        format!("data->{field}")
    }
}

/// Translate a filter into query parameters.
pub(crate) fn filter_params(filter: &Filter) -> AppResult<Vec<(String, String)>> {
    filter.validate_fields()?;

    let mut out = vec![("select".to_string(), "data".to_string())];
    for condition in &filter.conditions {
        let column = condition_column(&condition.field, condition.op, &condition.value);
        let expr = match condition.op {
            Op::IsNull => "is.null".to_string(),
            Op::Eq if condition.value.is_null() => "is.null".to_string(),
            Op::Ne if condition.value.is_null() => "not.is.null".to_string(),
            Op::Eq => format!("eq.{}", literal(&condition.value)),
            Op::Ne => format!("neq.{}", literal(&condition.value)),
            Op::Gt => format!("gt.{}", literal(&condition.value)),
            Op::Gte => format!("gte.{}", literal(&condition.value)),
            Op::Lt => format!("lt.{}", literal(&condition.value)),
            Op::Lte => format!("lte.{}", literal(&condition.value)),
            Op::In => {
                let members: Vec<String> = condition
                    .value
                    .as_array()
                    .map(|values| values.iter().map(list_member).collect())
                    .unwrap_or_default();
                format!("in.({})", members.join(","))
            }
        };
        out.push((column, expr));
    }
    if let Some((field, direction)) = &filter.order_by {
        let dir = match direction {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        };
        out.push(("order".to_string(), format!("{}.{dir}", order_column(field))));
    }
    if let Some(limit) = filter.limit {
        out.push(("limit".to_string(), limit.to_string()));
    }
    Ok(out)
}

/// A write that returns no representation was filtered out server side
/// (usually by a row-level policy).
fn ensure_written(rows: &[Value], context: &str) -> AppResult<()> {
    if rows.is_empty() {
        return Err(AppError::Store(format!("{context}: no row written")));
    }
    Ok(())
}

fn id_param(id: &str) -> (String, String) {
    ("id".to_string(), format!("eq.{id}"))
}

fn take_data(rows: Vec<Value>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|mut row| row.get_mut("data").map(Value::take))
        .collect()
}

impl Store for RestStore {
    fn backend_name(&self) -> &'static str {
        "rest"
    }

    fn insert(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let body = row_body(doc)?;
        let request = self
            .client
            .post(self.table_url(collection))
            .header("Prefer", "return=representation")
            .json(&body);
        let context = format!("insert {collection}");
        let rows = Self::rows(self.send(request, &context)?)?;
        ensure_written(&rows, &context)
    }

    fn update(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let body = row_body(doc)?;
        let id = body["id"].as_str().unwrap_or_default().to_string();
        let request = self
            .client
            .patch(self.table_url(collection))
            .query(&[id_param(&id)])
            .header("Prefer", "return=representation")
            .json(&body);
        let rows = Self::rows(self.send(request, &format!("update {collection}"))?)?;
        if rows.is_empty() {
            return Err(AppError::not_found(collection.as_str(), id));
        }
        Ok(())
    }

    fn get(&self, collection: Collection, id: &str) -> AppResult<Option<Value>> {
        let request = self
            .client
            .get(self.table_url(collection))
            .query(&[("select".to_string(), "data".to_string()), id_param(id)]);
        let rows = Self::rows(self.send(request, &format!("get {collection}"))?)?;
        Ok(take_data(rows).into_iter().next())
    }

    fn list(&self, collection: Collection, filter: &Filter) -> AppResult<Vec<Value>> {
        let params = filter_params(filter)?;
        debug!(collection = %collection, params = ?params, "REST list");
        let request = self.client.get(self.table_url(collection)).query(&params);
        let rows = Self::rows(self.send(request, &format!("list {collection}"))?)?;
        Ok(take_data(rows))
    }

    fn delete(&self, collection: Collection, id: &str) -> AppResult<bool> {
        let request = self
            .client
            .delete(self.table_url(collection))
            .query(&[id_param(id)])
            .header("Prefer", "return=representation");
        let rows = Self::rows(self.send(request, &format!("delete {collection}"))?)?;
        Ok(!rows.is_empty())
    }

    fn next_code(&self, collection: Collection) -> AppResult<i64> {
        let request = self
            .client
            .post(self.rpc_url(NEXT_CODE_RPC))
            .json(&serde_json::json!({ "collection_name": collection.as_str() }));
        let resp = self.send(request, &format!("next code {collection}"))?;
        let value: Value = resp.json()?;
        value
            .as_i64()
            .or_else(|| value.get(NEXT_CODE_RPC).and_then(Value::as_i64))
            .ok_or_else(|| AppError::Http(format!("unexpected next code response: {value}")))
    }
}

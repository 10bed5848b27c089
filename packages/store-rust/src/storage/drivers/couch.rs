//! HTTP document-store [`StorageDriver`] speaking the `CouchDB` protocol.
//!
//! Records map onto documents in one database. Map records become the
//! document body; any other record is wrapped under a single `rk:value`
//! field. Byte blobs travel as tagged strings. Ids the caller leaves out are
//! minted by the server.
//!
//! Every call is one HTTP round trip, so `begin()`/`commit()`/`rollback()`
//! are no-ops. Update and delete send the revision this store last observed
//! for the document; the server rejects a stale revision and the driver
//! reports [`StoreError::Conflict`]. Enumeration follows the server's
//! document-id collation; design documents are skipped.

use std::net::IpAddr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use restkit_core::codec::{decode_text, encode_tagged};
use restkit_core::{merge, Page, Record, RecordSet, ResourceId, StoreError, StoreResult, Value};
use serde::Deserialize;
use serde_json::json;

use super::revisions::RevisionCache;
use crate::config::CouchDbConfig;
use crate::storage::driver::{field_matches, DriverKind, StorageDriver};

static DATABASE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_$()+/-]*$").expect("database name pattern is valid"));
const WRAPPED: &str = "rk:value";
const DESIGN_PREFIX: &str = "_design/";
/// Rows requested per `_all_docs` round trip while scanning.
const SCAN_BATCH: usize = 100;

#[derive(Debug, Deserialize)]
struct WriteAck {
    id: String,
    rev: String,
}

#[derive(Debug, Deserialize)]
struct AllDocs {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
    #[serde(default)]
    doc: Option<serde_json::Value>,
}

/// Converts a record into a document body (without `_id`/`_rev`).
fn to_document(record: &Value) -> serde_json::Value {
    match record {
        Value::Map(fields) => serde_json::Value::Object(
            fields
                .iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .map(|(key, value)| (key.clone(), to_json_tagged(value)))
                .collect(),
        ),
        other => json!({ WRAPPED: to_json_tagged(other) }),
    }
}

fn to_json_tagged(value: &Value) -> serde_json::Value {
    match value {
        Value::Bytes(_) => serde_json::Value::String(encode_tagged(value).unwrap_or_default()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json_tagged).collect()),
        Value::Map(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), to_json_tagged(value)))
                .collect(),
        ),
        other => other.to_json(),
    }
}

fn untag(value: Value) -> Value {
    match value {
        Value::String(text) => decode_text(text),
        Value::Array(items) => Value::Array(items.into_iter().map(untag).collect()),
        Value::Map(fields) => Value::Map(fields.into_iter().map(|(k, v)| (k, untag(v))).collect()),
        other => other,
    }
}

/// Splits a fetched document into its revision and record.
fn from_document(doc: serde_json::Value) -> (Option<String>, Record) {
    let Value::Map(mut fields) = Value::from(doc) else {
        return (None, Value::Null);
    };
    let rev = fields
        .shift_remove("_rev")
        .and_then(|rev| rev.as_str().map(ToString::to_string));
    fields.retain(|key, _| !key.starts_with('_'));
    if fields.len() == 1 {
        if let Some(wrapped) = fields.shift_remove(WRAPPED) {
            return (rev, untag(wrapped));
        }
    }
    (rev, untag(Value::Map(fields)))
}

/// Loopback servers are reached directly, whatever the proxy environment says.
fn is_loopback(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback()),
        None => false,
    }
}

async fn unexpected(what: &str, response: Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    StoreError::medium(
        format!("couchdb {what}"),
        anyhow::anyhow!("unexpected status {status}: {body}"),
    )
}

/// `CouchDB`-protocol document store.
pub struct CouchDbDriver {
    client: Client,
    database_url: Url,
    username: Option<String>,
    password: Option<String>,
    revisions: RevisionCache<String>,
}

impl CouchDbDriver {
    /// Connects to the database, creating it when configured to.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] for malformed URLs or
    /// database names, unreachable or unauthorized servers, and missing
    /// databases that may not be created.
    pub async fn open(config: &CouchDbConfig) -> StoreResult<Self> {
        if !DATABASE_NAME.is_match(&config.database) {
            return Err(StoreError::InvalidConfiguration(format!(
                "couchdb: `{}` is not a valid database name",
                config.database
            )));
        }
        let mut database_url = Url::parse(&config.base_url).map_err(|e| {
            StoreError::InvalidConfiguration(format!("couchdb: bad base_url: {e}"))
        })?;
        database_url
            .path_segments_mut()
            .map_err(|()| {
                StoreError::InvalidConfiguration("couchdb: base_url cannot carry a path".to_string())
            })?
            .pop_if_empty()
            .push(&config.database);
        let mut builder = Client::builder();
        if is_loopback(&database_url) {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::InvalidConfiguration(format!("couchdb client: {e}")))?;

        let driver = Self {
            client,
            database_url,
            username: config.username.clone(),
            password: config.password.clone(),
            revisions: RevisionCache::new(),
        };
        driver.ensure_database(config).await?;
        tracing::info!(database = %config.database, "opened couchdb store");
        Ok(driver)
    }

    async fn ensure_database(&self, config: &CouchDbConfig) -> StoreResult<()> {
        let response = self
            .request(Method::GET, self.database_url.clone())
            .send()
            .await
            .map_err(|e| StoreError::InvalidConfiguration(format!("couchdb unreachable: {e}")))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND if config.create_database => {
                let response = self
                    .send(self.request(Method::PUT, self.database_url.clone()), "create database")
                    .await?;
                match response.status() {
                    s if s.is_success() || s == StatusCode::PRECONDITION_FAILED => {
                        tracing::info!(database = %config.database, "created couchdb database");
                        Ok(())
                    }
                    _ => Err(unexpected("create database", response).await),
                }
            }
            StatusCode::NOT_FOUND => Err(StoreError::InvalidConfiguration(format!(
                "couchdb: database `{}` does not exist",
                config.database
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                StoreError::InvalidConfiguration("couchdb: credentials rejected".to_string()),
            ),
            _ => Err(unexpected("database info", response).await),
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> StoreResult<Response> {
        builder
            .send()
            .await
            .map_err(|e| StoreError::medium(format!("couchdb {what}"), e))
    }

    fn url_with(&self, segment: &str) -> Url {
        let mut url = self.database_url.clone();
        // The base URL was checked to accept path segments in `open`.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(segment);
        }
        url
    }

    fn doc_url(&self, id: &ResourceId) -> Url {
        self.url_with(&id.to_string())
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response, what: &str) -> StoreResult<T> {
        response
            .json()
            .await
            .map_err(|e| StoreError::medium(format!("couchdb {what}"), e))
    }

    /// Current revision and body, without touching the revision cache.
    async fn fetch_current(&self, id: &ResourceId) -> StoreResult<Option<(String, Record)>> {
        let response = self
            .send(self.request(Method::GET, self.doc_url(id)), "read")
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let doc: serde_json::Value = Self::json(response, "read").await?;
                let (rev, record) = from_document(doc);
                Ok(Some((rev.unwrap_or_default(), record)))
            }
            _ => Err(unexpected("read", response).await),
        }
    }

    /// Reads `_all_docs` in collation order, leaving out design documents.
    ///
    /// Stops once `wanted` user documents are collected; `None` reads the
    /// whole database. Design rows still advance the server-side offset, so
    /// windows are counted in user documents only.
    async fn scan(
        &self,
        descending: bool,
        include_docs: bool,
        wanted: Option<usize>,
    ) -> StoreResult<Vec<AllDocsRow>> {
        let mut kept = Vec::new();
        if wanted == Some(0) {
            return Ok(kept);
        }
        let mut skip = 0usize;
        loop {
            let batch = wanted.map_or(SCAN_BATCH, |w| (w - kept.len()).clamp(1, SCAN_BATCH));
            let mut url = self.url_with("_all_docs");
            {
                let mut query = url.query_pairs_mut();
                if include_docs {
                    query.append_pair("include_docs", "true");
                }
                if descending {
                    query.append_pair("descending", "true");
                }
                query
                    .append_pair("limit", &batch.to_string())
                    .append_pair("skip", &skip.to_string());
            }
            let response = self.send(self.request(Method::GET, url), "list").await?;
            if !response.status().is_success() {
                return Err(unexpected("list", response).await);
            }
            let rows = Self::json::<AllDocs>(response, "list").await?.rows;
            let fetched = rows.len();
            skip += fetched;
            kept.extend(rows.into_iter().filter(|row| !row.id.starts_with(DESIGN_PREFIX)));
            if fetched < batch || wanted.is_some_and(|w| kept.len() >= w) {
                break;
            }
        }
        Ok(kept)
    }

    async fn list(&self, page: Option<Page>, descending: bool) -> StoreResult<RecordSet> {
        let wanted = page.map(|p| p.offset().saturating_add(p.limit));
        let mut records = RecordSet::new();
        for row in self.scan(descending, true, wanted).await? {
            let Some(doc) = row.doc else { continue };
            let id = ResourceId::parse(&row.id);
            let (rev, record) = from_document(doc);
            if let Some(rev) = rev {
                self.revisions.observe(&id, rev);
            }
            records.insert(id, record);
        }
        Ok(match page {
            Some(page) => page.apply(records),
            None => records,
        })
    }
}

#[async_trait]
impl StorageDriver for CouchDbDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::CouchDb
    }

    async fn begin(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create(&self, record: Record, id: Option<ResourceId>) -> StoreResult<ResourceId> {
        let body = to_document(&record);
        let builder = match &id {
            Some(id) => self.request(Method::PUT, self.doc_url(id)),
            None => self.request(Method::POST, self.database_url.clone()),
        };
        let response = self.send(builder.json(&body), "create").await?;
        match response.status() {
            StatusCode::CONFLICT => {
                let id = id.unwrap_or_else(|| ResourceId::Str(String::new()));
                Err(StoreError::conflict(&id, "id already exists"))
            }
            status if status.is_success() => {
                let ack: WriteAck = Self::json(response, "create").await?;
                let id = ResourceId::parse(&ack.id);
                tracing::debug!(id = %id, rev = %ack.rev, "created couchdb document");
                self.revisions.observe(&id, ack.rev);
                Ok(id)
            }
            _ => Err(unexpected("create", response).await),
        }
    }

    async fn read(&self, id: &ResourceId) -> StoreResult<Record> {
        let (rev, record) = self
            .fetch_current(id)
            .await?
            .ok_or_else(|| StoreError::not_found(id))?;
        self.revisions.observe(id, rev);
        Ok(record)
    }

    async fn update(&self, partial: Record, id: &ResourceId) -> StoreResult<Record> {
        let (current_rev, existing) = self
            .fetch_current(id)
            .await?
            .ok_or_else(|| StoreError::not_found(id))?;
        let rev = self.revisions.get(id).unwrap_or(current_rev);
        let merged = merge(existing, partial);
        let mut body = to_document(&merged);
        if let Some(fields) = body.as_object_mut() {
            fields.insert("_rev".to_string(), serde_json::Value::String(rev.clone()));
        }

        let response = self
            .send(self.request(Method::PUT, self.doc_url(id)).json(&body), "update")
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Err(StoreError::conflict(id, format!("stale revision {rev}"))),
            StatusCode::NOT_FOUND => Err(StoreError::not_found(id)),
            status if status.is_success() => {
                let ack: WriteAck = Self::json(response, "update").await?;
                self.revisions.observe(id, ack.rev);
                Ok(merged)
            }
            _ => Err(unexpected("update", response).await),
        }
    }

    async fn delete(&self, id: &ResourceId) -> StoreResult<Record> {
        let (current_rev, existing) = self
            .fetch_current(id)
            .await?
            .ok_or_else(|| StoreError::not_found(id))?;
        let rev = self.revisions.get(id).unwrap_or(current_rev);
        let mut url = self.doc_url(id);
        url.query_pairs_mut().append_pair("rev", &rev);

        let response = self.send(self.request(Method::DELETE, url), "delete").await?;
        match response.status() {
            StatusCode::CONFLICT => Err(StoreError::conflict(id, format!("stale revision {rev}"))),
            StatusCode::NOT_FOUND => Err(StoreError::not_found(id)),
            status if status.is_success() => {
                self.revisions.forget(id);
                Ok(existing)
            }
            _ => Err(unexpected("delete", response).await),
        }
    }

    async fn exists(&self, id: &ResourceId) -> StoreResult<bool> {
        let response = self
            .send(self.request(Method::HEAD, self.doc_url(id)), "exists")
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(unexpected("exists", response).await),
        }
    }

    async fn all(&self, page: Option<Page>) -> StoreResult<RecordSet> {
        self.list(page, false).await
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let records = self.list(None, false).await?;
        if records.is_empty() {
            return Ok(0);
        }
        let docs: Vec<serde_json::Value> = records
            .keys()
            .filter_map(|id| {
                let rev = self.revisions.get(id)?;
                Some(json!({ "_id": id.to_string(), "_rev": rev, "_deleted": true }))
            })
            .collect();
        let response = self
            .send(
                self.request(Method::POST, self.url_with("_bulk_docs"))
                    .json(&json!({ "docs": docs })),
                "delete all",
            )
            .await?;
        if !response.status().is_success() {
            return Err(unexpected("delete all", response).await);
        }
        let results: Vec<serde_json::Value> = Self::json(response, "delete all").await?;
        let removed = results
            .iter()
            .filter(|result| result.get("error").is_none())
            .count() as u64;
        self.revisions.clear();
        Ok(removed)
    }

    async fn count(&self) -> StoreResult<u64> {
        let rows = self.scan(false, false, None).await?;
        Ok(rows.len() as u64)
    }

    async fn search(&self, field: &str, value: &Value) -> StoreResult<RecordSet> {
        let mut records = self.list(None, false).await?;
        records.retain(|_, record| field_matches(record, field, value));
        Ok(records)
    }

    async fn first(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        Ok(self
            .list(Some(Page::new(1, 1)), false)
            .await?
            .into_iter()
            .next())
    }

    async fn last(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        Ok(self
            .list(Some(Page::new(1, 1)), true)
            .await?
            .into_iter()
            .next())
    }
}

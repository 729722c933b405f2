//! Blocking HTTP implementation of the index-store interface the migration
//! engine drives: bulk writes, scroll scans, template and index CRUD,
//! settings retrieval, and the root version probe.

use std::collections::VecDeque;
use std::time::Duration;

use migrates_core::{BulkAction, Document, IndexConfig, IndexStore, OpType, StoreError, TemplateMap};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_HOST: &str = "http://localhost:9200";

const SCROLL_KEEP_ALIVE: &str = "1m";
const SCROLL_PAGE_SIZE: usize = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

enum RequestBody<'a> {
    Json(&'a Value),
    Ndjson(&'a str),
}

/// A connection to one store cluster, given as one or more host URLs.
/// Requests try each host in order until one answers at the transport level.
#[derive(Debug)]
pub struct HttpStore {
    agent: ureq::Agent,
    hosts: Vec<Url>,
}

impl HttpStore {
    pub fn new(hosts: &[String]) -> Result<HttpStore, StoreError> {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        let hosts: Vec<&str> = if hosts.is_empty() {
            vec![DEFAULT_HOST]
        } else {
            hosts.iter().map(String::as_str).collect()
        };
        let hosts = hosts
            .into_iter()
            .map(|host| {
                Url::parse(host)
                    .map_err(|error| StoreError::Transport(format!("invalid host \"{host}\": {error}")))
            })
            .collect::<Result<Vec<Url>, StoreError>>()?;
        Ok(HttpStore { agent, hosts })
    }

    fn request(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<RequestBody<'_>>,
    ) -> Result<ureq::Response, StoreError> {
        let mut last: Option<StoreError> = None;
        for host in &self.hosts {
            let mut url = host.join(path).map_err(|error| {
                StoreError::Transport(format!("cannot build url for \"{path}\": {error}"))
            })?;
            for (name, value) in query {
                url.query_pairs_mut().append_pair(name, value);
            }
            let request = self.agent.request_url(method, &url);
            let result = match &body {
                None => request.call(),
                Some(RequestBody::Json(value)) => request.send_json(*value),
                Some(RequestBody::Ndjson(text)) => request
                    .set("Content-Type", "application/x-ndjson")
                    .send_string(text),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(ureq::Error::Status(404, _)) => {
                    return Err(StoreError::NotFound(path.to_string()));
                }
                Err(ureq::Error::Status(code, response)) => {
                    let reason = response.into_string().unwrap_or_default();
                    return Err(StoreError::UnexpectedResponse(format!(
                        "{method} {path} answered {code}: {reason}"
                    )));
                }
                Err(ureq::Error::Transport(transport)) => {
                    debug!("transport error against host \"{host}\": {transport}");
                    last = Some(StoreError::Transport(transport.to_string()));
                }
            }
        }
        Err(last.unwrap_or_else(|| StoreError::Transport("no hosts configured".to_string())))
    }

    fn request_json(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, StoreError> {
        let response = self.request(method, path, query, body.map(RequestBody::Json))?;
        response
            .into_json()
            .map_err(|error| StoreError::UnexpectedResponse(format!("{method} {path}: {error}")))
    }

    fn scroll_page(&self, scroll_id: &str) -> Result<Value, StoreError> {
        self.request_json(
            "POST",
            "/_search/scroll",
            &[],
            Some(&json!({"scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id})),
        )
    }

    fn end_scroll(&self, scroll_id: &str) {
        let body = json!({"scroll_id": scroll_id});
        if let Err(error) = self.request("DELETE", "/_search/scroll", &[], Some(RequestBody::Json(&body)))
        {
            debug!("failed to clear scroll context: {error}");
        }
    }
}

impl IndexStore for HttpStore {
    fn server_version(&self) -> Result<String, StoreError> {
        let root = self.request_json("GET", "/", &[], None)?;
        root.pointer("/version/number")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                StoreError::UnexpectedResponse("root endpoint reported no version".to_string())
            })
    }

    fn list_indexes(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let query = [("expand_wildcards", "open,closed")];
        match self.request_json("GET", &format!("/{pattern}/_settings"), &query, None) {
            Ok(settings) => Ok(settings
                .as_object()
                .map(|object| object.keys().cloned().collect())
                .unwrap_or_default()),
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(error) => Err(error),
        }
    }

    fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        match self.request("HEAD", &format!("/{index}"), &[], None) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn create_index(&self, index: &str, config: &IndexConfig) -> Result<(), StoreError> {
        let body = json!({"settings": config.settings, "mappings": config.mappings});
        self.request("PUT", &format!("/{index}"), &[], Some(RequestBody::Json(&body)))?;
        Ok(())
    }

    fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        self.request("DELETE", &format!("/{index}"), &[], None)?;
        Ok(())
    }

    fn index_config(&self, index: &str) -> Result<IndexConfig, StoreError> {
        let mappings = self.request_json("GET", &format!("/{index}/_mapping"), &[], None)?;
        let settings = self.request_json("GET", &format!("/{index}/_settings"), &[], None)?;
        let extract = |value: &Value, field: &str| {
            value.pointer(&format!("/{index}/{field}")).cloned().ok_or_else(|| {
                StoreError::UnexpectedResponse(format!(
                    "missing {field} in response for index \"{index}\""
                ))
            })
        };
        Ok(IndexConfig {
            settings: extract(&settings, "settings")?,
            mappings: extract(&mappings, "mappings")?,
        })
    }

    fn templates(&self) -> Result<TemplateMap, StoreError> {
        let templates = self.request_json("GET", "/_template", &[], None)?;
        match templates {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::UnexpectedResponse(format!(
                "template catalog is not an object: {other}"
            ))),
        }
    }

    fn put_template(&self, name: &str, body: &Value, create: bool) -> Result<(), StoreError> {
        let query = [("create", if create { "true" } else { "false" })];
        self.request("PUT", &format!("/_template/{name}"), &query, Some(RequestBody::Json(body)))?;
        Ok(())
    }

    fn delete_template(&self, name: &str) -> Result<(), StoreError> {
        self.request("DELETE", &format!("/_template/{name}"), &[], None)?;
        Ok(())
    }

    fn scan<'a>(
        &'a self,
        index: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<Document, StoreError>> + 'a>, StoreError> {
        let query = [("scroll", SCROLL_KEEP_ALIVE)];
        let body = json!({
            "query": {"match_all": {}},
            "sort": ["_doc"],
            "size": SCROLL_PAGE_SIZE,
        });
        let page =
            self.request_json("POST", &format!("/{index}/_search"), &query, Some(&body))?;
        Ok(Box::new(Scan::new(self, page)))
    }

    fn bulk(&self, actions: &[BulkAction]) -> Result<(), StoreError> {
        if actions.is_empty() {
            return Ok(());
        }
        let body = bulk_body(actions);
        let response = self.request("POST", "/_bulk", &[], Some(RequestBody::Ndjson(&body)))?;
        let response: Value = response
            .into_json()
            .map_err(|error| StoreError::UnexpectedResponse(format!("POST /_bulk: {error}")))?;
        match bulk_errors(&response) {
            Some(reason) => Err(StoreError::BulkRejected(reason)),
            None => Ok(()),
        }
    }

    fn settle(&self, seconds: u64) {
        info!("waiting {seconds} seconds for the store to settle");
        std::thread::sleep(Duration::from_secs(seconds));
    }
}

/// Serialize bulk actions into the newline-delimited body the bulk endpoint
/// expects: one action line per document, followed by its source where the
/// operation carries one.
fn bulk_body(actions: &[BulkAction]) -> String {
    let mut body = String::new();
    for action in actions {
        let op = match action.op_type {
            OpType::Index => "index",
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
        };
        let coordinates =
            json!({"_index": action.index, "_type": action.doc_type, "_id": action.id});
        let mut header = serde_json::Map::new();
        header.insert(op.to_string(), coordinates);
        body.push_str(&Value::Object(header).to_string());
        body.push('\n');
        match action.op_type {
            OpType::Delete => {}
            OpType::Update => {
                body.push_str(&json!({"doc": action.source}).to_string());
                body.push('\n');
            }
            OpType::Index | OpType::Create => {
                body.push_str(&Value::Object(action.source.clone()).to_string());
                body.push('\n');
            }
        }
    }
    body
}

/// A short description of the per-item errors of a bulk response, if it
/// reported any.
fn bulk_errors(response: &Value) -> Option<String> {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let items = response.get("items").and_then(Value::as_array)?;
    let mut failed = 0usize;
    let mut reasons: Vec<String> = Vec::new();
    for item in items {
        let error = item
            .as_object()
            .and_then(|operations| operations.values().next())
            .and_then(|result| result.get("error"));
        if let Some(error) = error {
            failed += 1;
            if reasons.len() < 3 {
                reasons.push(error.to_string());
            }
        }
    }
    Some(format!("{} item(s) failed, including: {}", failed.max(1), reasons.join("; ")))
}

struct Scan<'a> {
    store: &'a HttpStore,
    scroll_id: Option<String>,
    buffered: VecDeque<Result<Document, StoreError>>,
    done: bool,
}

impl<'a> Scan<'a> {
    fn new(store: &'a HttpStore, first_page: Value) -> Scan<'a> {
        let mut scan =
            Scan { store, scroll_id: None, buffered: VecDeque::new(), done: false };
        scan.absorb(first_page);
        scan
    }

    fn absorb(&mut self, page: Value) {
        self.scroll_id = page
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.scroll_id.take());
        let hits = page
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if hits.is_empty() {
            self.done = true;
            if let Some(scroll_id) = self.scroll_id.take() {
                self.store.end_scroll(&scroll_id);
            }
            return;
        }
        for hit in hits {
            self.buffered.push_back(serde_json::from_value(hit).map_err(|error| {
                StoreError::UnexpectedResponse(format!("malformed search hit: {error}"))
            }));
        }
    }
}

impl Iterator for Scan<'_> {
    type Item = Result<Document, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            let scroll_id = match self.scroll_id.clone() {
                Some(scroll_id) => scroll_id,
                None => return None,
            };
            match self.store.scroll_page(&scroll_id) {
                Ok(page) => self.absorb(page),
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::attributes::Attributes;
use crate::error::StoreError;
use crate::payload::{RemoteRecordKey, SampleValue};

const USER_AGENT: &str = "SceneBench/0.1 (metrics-store)";
const ALREADY_EXISTS: &str = "resource_already_exists_exception";
pub const IMAGE_UNAVAILABLE: &str = "Image unavailable";

/// Minimal JSON transport the metrics store protocol runs over.
pub trait StoreHttp {
    fn put_json(&self, url: &str, body: Option<&Value>) -> Result<Value, StoreError>;
    fn get_json(&self, url: &str, body: &Value) -> Result<Value, StoreError>;
    fn post_json(&self, url: &str, body: &Value) -> Result<Value, StoreError>;
}

pub struct BlockingStoreHttp {
    client: Client,
}

impl BlockingStoreHttp {
    pub fn new(timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|source| StoreError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }

    fn send(&self, url: &str, request: RequestBuilder) -> Result<Value, StoreError> {
        let response = request.send().map_err(|source| StoreError::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        let text = response.text().map_err(|source| StoreError::Transport {
            url: url.to_string(),
            source,
        })?;
        if !status.is_success() {
            return Err(StoreError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| StoreError::Decode {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }
}

impl StoreHttp for BlockingStoreHttp {
    fn put_json(&self, url: &str, body: Option<&Value>) -> Result<Value, StoreError> {
        let mut request = self.client.put(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(url, request)
    }

    fn get_json(&self, url: &str, body: &Value) -> Result<Value, StoreError> {
        self.send(url, self.client.get(url).json(body))
    }

    fn post_json(&self, url: &str, body: &Value) -> Result<Value, StoreError> {
        self.send(url, self.client.post(url).json(body))
    }
}

/// Outcome of ensuring the index exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Created,
    AlreadyExists,
}

/// Document created for each (scene, date, build) key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRecord {
    pub device_serial: String,
    pub device_name: String,
    pub date_of_test: String,
    pub apk_name: String,
    pub scene_name: String,
    pub target_architecture: String,
    pub scripting_backend: String,
    #[serde(rename = "build_Type")]
    pub build_type: String,
    pub unity_version: String,
    pub changeset: String,
    #[serde(rename = "graphics_API")]
    pub graphics_api: String,
    pub image: String,
    pub data: Vec<f64>,
    pub error_log: Vec<String>,
}

impl TestRecord {
    /// Empty-sample record for `key`, stamped with device and build metadata.
    pub fn new(
        key: &RemoteRecordKey<'_>,
        device: &DeviceIdentity,
        attributes: &Attributes,
        image: Option<&str>,
    ) -> Self {
        Self {
            device_serial: device.serial.clone(),
            device_name: device.name.clone(),
            date_of_test: key.date_of_test.to_string(),
            apk_name: key.apk_name.to_string(),
            scene_name: key.scene_name.to_string(),
            target_architecture: attributes.architecture.clone(),
            scripting_backend: attributes.scripting_backend.clone(),
            build_type: attributes.build_type.clone(),
            unity_version: attributes.unity_version.clone(),
            changeset: attributes.changeset.clone(),
            graphics_api: attributes.graphics_api.clone(),
            image: image.unwrap_or(IMAGE_UNAVAILABLE).to_string(),
            data: Vec::new(),
            error_log: Vec::new(),
        }
    }
}

/// Which physical device produced the samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub name: String,
    pub asset_tag: String,
}

impl DeviceIdentity {
    pub fn unnamed(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            name: "Unknown".into(),
            asset_tag: "Unknown".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
}

/// Client for one index of the remote metrics store.
pub struct MetricsStore<H: StoreHttp> {
    base: String,
    index: String,
    http: H,
}

impl<H: StoreHttp> MetricsStore<H> {
    /// `index` is lower-cased; the store rejects upper-case index names.
    pub fn new(base_url: &str, index: &str, http: H) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            index: index.trim().to_lowercase(),
            http,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.base, self.index)
    }

    /// Create the index, treating "already exists" as success.
    pub fn ensure_index(&self) -> Result<IndexStatus, StoreError> {
        let url = self.index_url();
        match self.http.put_json(&url, None) {
            Ok(_) => {
                info!(index = %self.index, "metrics index created");
                Ok(IndexStatus::Created)
            }
            Err(err) if err.error_type().as_deref() == Some(ALREADY_EXISTS) => {
                debug!(index = %self.index, "metrics index already exists");
                Ok(IndexStatus::AlreadyExists)
            }
            Err(err) => Err(err),
        }
    }

    /// Ids of every record matching `key` exactly on all three fields.
    pub fn find_records(&self, key: &RemoteRecordKey<'_>) -> Result<Vec<String>, StoreError> {
        let url = format!("{}/_search", self.index_url());
        let query = json!({
            "query": {
                "bool": {
                    "must": [
                        {"match_phrase": {"scene_name": key.scene_name}},
                        {"match_phrase": {"date_of_test": key.date_of_test}},
                        {"match_phrase": {"apk_name": key.apk_name}}
                    ]
                }
            }
        });
        let response = self.http.get_json(&url, &query)?;
        let parsed: SearchResponse =
            serde_json::from_value(response).map_err(|err| StoreError::Decode {
                url: url.clone(),
                reason: err.to_string(),
            })?;
        Ok(parsed.hits.hits.into_iter().map(|hit| hit.id).collect())
    }

    /// Create a record and return its generated id.
    ///
    /// Waits for the index refresh so a later `find_records` for the same key sees it.
    pub fn create_record(&self, record: &TestRecord) -> Result<String, StoreError> {
        let url = format!("{}/_doc?refresh=wait_for", self.index_url());
        let body = serde_json::to_value(record).map_err(|err| StoreError::Decode {
            url: url.clone(),
            reason: err.to_string(),
        })?;
        let response = self.http.post_json(&url, &body)?;
        response
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Decode {
                url,
                reason: "response is missing `_id`".into(),
            })
    }

    /// Append a sample server-side; the client never rewrites the arrays itself.
    pub fn append_sample(&self, id: &str, value: &SampleValue) -> Result<(), StoreError> {
        let url = format!("{}/_update/{id}", self.index_url());
        self.http.post_json(&url, &append_script(value))?;
        Ok(())
    }
}

/// Painless update script appending `value` to `data` or `error_log`.
pub fn append_script(value: &SampleValue) -> Value {
    let (field, param) = match value {
        SampleValue::Numeric(number) => ("data", json!(number)),
        SampleValue::Error(message) => ("error_log", json!(message)),
    };
    json!({
        "script": {
            "lang": "painless",
            "source": format!(
                "if (ctx._source.{field} == null) {{ ctx._source.{field} = []; }} ctx._source.{field}.add(params.value);"
            ),
            "params": {"value": param}
        }
    })
}

use std::{env, time::Duration};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::InventorySettings;
use crate::store::DeviceIdentity;

/// Asset-inventory service naming the physical devices under test.
pub struct Inventory {
    base: Url,
    token: Option<String>,
    client: Client,
}

impl Inventory {
    /// `None` when no inventory URL is configured.
    pub fn from_settings(settings: &InventorySettings, timeout: Duration) -> Result<Option<Self>> {
        let Some(raw) = settings.url.as_deref().filter(|url| !url.trim().is_empty()) else {
            return Ok(None);
        };
        let base = Url::parse(raw).with_context(|| format!("Invalid inventory URL {raw}"))?;
        let token = settings
            .api_key_env
            .as_deref()
            .and_then(|name| env::var(name).ok())
            .filter(|token| !token.is_empty());
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build inventory HTTP client")?;
        Ok(Some(Self {
            base,
            token,
            client,
        }))
    }

    /// Look up `serial`; any failure leaves name and asset tag as `Unknown`.
    pub fn identify(&self, serial: &str) -> DeviceIdentity {
        let mut identity = DeviceIdentity::unnamed(serial);
        match self.lookup(serial) {
            Ok(Some((name, asset_tag))) => {
                debug!(serial, name = %name, asset_tag = %asset_tag, "device found in inventory");
                identity.name = name;
                identity.asset_tag = asset_tag;
            }
            Ok(None) => warn!(serial, "device not listed in inventory"),
            Err(err) => warn!(serial, error = %err, "inventory lookup failed"),
        }
        identity
    }

    fn lookup(&self, serial: &str) -> Result<Option<(String, String)>> {
        let url = lookup_url(&self.base, serial)?;
        let mut request = self.client.get(url.clone()).header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", token);
        }
        let response = request
            .send()
            .with_context(|| format!("Failed to reach inventory at {url}"))?
            .error_for_status()
            .with_context(|| format!("Inventory rejected {url}"))?;
        let body: Value = response
            .json()
            .with_context(|| format!("Inventory returned malformed JSON from {url}"))?;
        Ok(parse_rows(&body))
    }
}

/// `<base>/api/v1/hardware?search=<serial>`, keeping any path prefix on `base`.
pub fn lookup_url(base: &Url, serial: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    let mut url = base
        .join("api/v1/hardware")
        .with_context(|| format!("Cannot build inventory URL from {base}"))?;
    url.query_pairs_mut().append_pair("search", serial);
    Ok(url)
}

/// Name and asset tag of the first matching row.
pub fn parse_rows(body: &Value) -> Option<(String, String)> {
    let row = body.get("rows")?.as_array()?.first()?;
    let name = row.get("name")?.as_str()?.to_string();
    let asset_tag = row.get("asset_tag")?.as_str()?.to_string();
    Some((name, asset_tag))
}

//! HTTP client for the upstream game catalog.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::application::catalog::CatalogSource;
use crate::cache::FetchError;
use crate::config::UpstreamSettings;

use super::error::InfraError;

const API_KEY_PARAM: &str = "key";
const MAX_ERROR_BODY: usize = 256;

#[derive(Clone, Debug)]
pub struct HttpCatalog {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpCatalog {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build client: {err}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            timeout: settings.timeout,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("playcache/", env!("CARGO_PKG_VERSION"))
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| FetchError::transport(format!("invalid upstream path `{path}`: {err}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
            if let Some(key) = self.api_key.as_ref() {
                pairs.append_pair(API_KEY_PARAM, key);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, FetchError> {
        let path = url.path().to_string();
        debug!(upstream_path = %path, "Upstream request");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| self.request_error(&path, &err))?;
        let response = Self::check_status(&path, response).await?;

        response
            .json::<Value>()
            .await
            .map_err(|err| self.request_error(&path, &err))
    }

    async fn check_status(path: &str, response: Response) -> Result<Response, FetchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message: String = body.chars().take(MAX_ERROR_BODY).collect();
        warn!(
            upstream_path = %path,
            status = status.as_u16(),
            "Upstream returned an error status"
        );
        Err(FetchError::status(status.as_u16(), message))
    }

    fn request_error(&self, path: &str, err: &reqwest::Error) -> FetchError {
        if err.is_timeout() {
            warn!(upstream_path = %path, timeout_ms = self.timeout.as_millis() as u64, "Upstream request timed out");
            return FetchError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            };
        }
        warn!(upstream_path = %path, error = %err, "Upstream request failed");
        FetchError::from_error(err)
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn game(&self, id: u64) -> Result<Value, FetchError> {
        let url = self.url(&format!("games/{id}"), &[])?;
        self.get_json(url).await
    }

    async fn games(&self, ids: &[u64]) -> Result<HashMap<u64, Value>, FetchError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let joined = ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.url("games", &[("ids", joined)])?;

        match self.get_json(url).await? {
            Value::Array(items) => Ok(index_by_id(items)),
            other => Err(FetchError::transport(format!(
                "expected a JSON array of games, got {}",
                json_kind(&other)
            ))),
        }
    }
}

/// Items without a numeric `id` are skipped.
fn index_by_id(items: Vec<Value>) -> HashMap<u64, Value> {
    items
        .into_iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_u64)?;
            Some((id, item))
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn catalog(api_key: Option<&str>) -> HttpCatalog {
        HttpCatalog::new(&UpstreamSettings {
            base_url: Url::parse("https://catalog.example.com/v2/").expect("valid url"),
            api_key: api_key.map(str::to_string),
            timeout: Duration::from_secs(1),
        })
        .expect("client builds")
    }

    #[test]
    fn urls_are_joined_under_base_path() {
        let url = catalog(None).url("games/42", &[]).expect("url");
        assert_eq!(url.as_str(), "https://catalog.example.com/v2/games/42");
    }

    #[test]
    fn api_key_is_sent_as_query_parameter() {
        let url = catalog(Some("s3cret"))
            .url("games", &[("ids", "1,2".to_string())])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://catalog.example.com/v2/games?ids=1%2C2&key=s3cret"
        );
    }

    #[test]
    fn batch_items_are_indexed_by_id() {
        let indexed = index_by_id(vec![
            json!({"id": 1, "name": "One"}),
            json!({"name": "no id"}),
            json!({"id": 3}),
        ]);
        assert_eq!(indexed.len(), 2);
        assert_eq!(indexed[&1]["name"], "One");
        assert!(indexed.contains_key(&3));
    }
}

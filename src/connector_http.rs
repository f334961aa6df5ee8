//! HTTP JSON feed connector.
//!
//! Fetches a registry listing from an HTTP endpoint that returns either a JSON
//! array of records or an object with an `items` array. Transport failures
//! and non-2xx responses mean the upstream is unavailable; records that fail
//! to decode are reported individually.
//!
//! With `since_param` configured and a previous successful crawl on record,
//! the request asks only for records changed since then. Such a listing is
//! incomplete by definition and is flagged so staleness is not reconciled
//! against it.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;

use crate::config::HttpConnectorConfig;
use crate::connector_file::decode_elements;
use crate::error::ConnectorError;
use crate::traits::{Connector, IndexResult, PreviousState};

pub struct HttpConnector {
    name: String,
    config: HttpConnectorConfig,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(name: String, config: HttpConnectorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("plugin-index/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name,
            config,
            client,
        }
    }

    fn request_url(&self, previous: Option<&PreviousState>) -> Result<(Url, bool), ConnectorError> {
        let mut url = Url::parse(&self.config.url).map_err(|e| {
            ConnectorError::Unavailable(format!("invalid url '{}': {}", self.config.url, e))
        })?;
        let mut complete = true;
        if let (Some(param), Some(previous)) = (&self.config.since_param, previous) {
            url.query_pairs_mut()
                .append_pair(param, &previous.last_success_at.to_rfc3339());
            complete = false;
        }
        Ok((url, complete))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records from an HTTP JSON feed"
    }

    async fn run(&self, previous: Option<&PreviousState>) -> Result<IndexResult, ConnectorError> {
        let (url, complete) = self.request_url(previous)?;

        let mut request = self.client.get(url.clone());
        if let Some(var) = &self.config.token_env {
            if let Ok(token) = std::env::var(var) {
                request = request.bearer_auth(token);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectorError::Unavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::Unavailable(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Unavailable(format!("{}: invalid JSON body: {}", url, e)))?;

        let elements = match body {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("items") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(ConnectorError::Unavailable(format!(
                        "{}: expected an array or an object with `items`",
                        url
                    )))
                }
            },
            _ => {
                return Err(ConnectorError::Unavailable(format!(
                    "{}: expected an array or an object with `items`",
                    url
                )))
            }
        };

        let mut result = IndexResult {
            complete,
            ..Default::default()
        };
        decode_elements(elements, url.as_str(), &mut result);

        tracing::debug!(
            connector = %self.name,
            items = result.items.len(),
            errors = result.source_errors.len(),
            complete,
            "fetched feed"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn connector(since_param: Option<&str>) -> HttpConnector {
        HttpConnector::new(
            "http:test".into(),
            HttpConnectorConfig {
                url: "https://registry.example.com/servers?limit=500".into(),
                token_env: None,
                since_param: since_param.map(String::from),
                timeout_secs: 5,
            },
        )
    }

    #[test]
    fn full_listing_without_previous_state() {
        let (url, complete) = connector(Some("since")).request_url(None).unwrap();
        assert!(complete);
        assert_eq!(url.as_str(), "https://registry.example.com/servers?limit=500");
    }

    #[test]
    fn incremental_listing_is_incomplete() {
        let previous = PreviousState {
            last_success_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            items: 10,
        };
        let (url, complete) = connector(Some("since"))
            .request_url(Some(&previous))
            .unwrap();
        assert!(!complete);
        assert!(url.as_str().contains("since=2026-03-01T12%3A00%3A00%2B00%3A00"));
    }

    #[test]
    fn previous_state_ignored_without_since_param() {
        let previous = PreviousState {
            last_success_at: Utc::now(),
            items: 1,
        };
        let (_, complete) = connector(None).request_url(Some(&previous)).unwrap();
        assert!(complete);
    }
}

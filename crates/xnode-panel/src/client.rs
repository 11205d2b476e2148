//! HTTP implementation of [`RemoteSource`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument, trace};
use xnode_error::{debug_report, internal, warn_report};

use crate::model::{PostData, RuleList, ServerConfig};
use crate::roster::parse_roster_wire;
use crate::rules::{compile_rules, load_local_rules};
use crate::source::{ClientInfo, Fetched, OnlineRecord, RemoteSource, TrafficRecord};
use crate::{DetectRule, Error, NodeDescriptor, PanelConfig, Result, ServiceInfo};

/// A resource we fetch conditionally.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
enum Endpoint {
    /// The node descriptor.
    Server,
    /// The roster.
    Services,
    /// The rule list.
    Rules,
}

impl Endpoint {
    /// Return the path of this resource for `node_id`.
    fn path(self, node_id: u32) -> String {
        match self {
            Endpoint::Server => format!("/api/backend/server/{}", node_id),
            Endpoint::Services => format!("/api/backend/service/{}", node_id),
            Endpoint::Rules => format!("/api/backend/rules/{}", node_id),
        }
    }
}

/// A client for the management panel's HTTP API.
///
/// Every request carries the configured key as a `key` query parameter.
/// Requests that fail without an answer (connection failure, timeout) are
/// retried up to the configured number of attempts; requests that get an
/// error status are not.
#[derive(Debug)]
pub struct PanelClient {
    /// The HTTP client, with our timeout.
    http: Client,
    /// Base URL of the panel.
    api_host: String,
    /// Our node identifier.
    node_id: u32,
    /// Authentication key.
    key: String,
    /// Number of attempts per request.
    retry_count: u32,
    /// ETag of the last successfully parsed response, per endpoint.
    etags: Mutex<HashMap<Endpoint, String>>,
    /// Number of addresses per uid in our last online report.
    ///
    /// Consumed (and cleared) by the next roster parse.
    last_online: Mutex<HashMap<u64, u32>>,
    /// Rules from the local rule file.
    local_rules: Arc<[DetectRule]>,
}

impl PanelClient {
    /// Create a new client from `config`.
    ///
    /// If a rule list is configured and can't be read, we log a warning
    /// and carry on without local rules.
    pub fn new(config: &PanelConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::ClientSetup(Arc::new(e)))?;

        let local_rules = match config.rule_list_path() {
            Some(path) => load_local_rules(path).unwrap_or_else(|e| {
                warn_report!(e, "Continuing without local detection rules");
                Vec::new()
            }),
            None => Vec::new(),
        };

        Ok(PanelClient {
            http,
            api_host: config.api_host().to_owned(),
            node_id: config.node_id(),
            key: config.key().to_owned(),
            retry_count: config.retry_count(),
            etags: Mutex::new(HashMap::new()),
            last_online: Mutex::new(HashMap::new()),
            local_rules: local_rules.into(),
        })
    }

    /// Return the full URL of `path`, without credentials.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_host, path)
    }

    /// Lock the ETag table.
    fn etags(&self) -> Result<MutexGuard<'_, HashMap<Endpoint, String>>> {
        Ok(self
            .etags
            .lock()
            .map_err(|_| internal!("panel ETag table poisoned"))?)
    }

    /// Lock the table of last reported online counts.
    fn last_online(&self) -> Result<MutexGuard<'_, HashMap<u64, u32>>> {
        Ok(self
            .last_online
            .lock()
            .map_err(|_| internal!("panel online counts poisoned"))?)
    }

    /// Send the request built by `build`, retrying on transport failure.
    async fn send(&self, url: &str, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut attempt = 1;
        loop {
            match build().query(&[("key", &self.key)]).send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.retry_count => {
                    debug_report!(e, "Request {} failed (attempt {})", url, attempt);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Request {
                        url: url.to_owned(),
                        cause: Arc::new(e),
                    })
                }
            }
        }
    }

    /// Turn an error status into an error.
    async fn check_status(url: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                url: url.to_owned(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Fetch `endpoint` conditionally and parse it with `parse`.
    ///
    /// The endpoint's ETag is only remembered once `parse` has succeeded,
    /// so a response we couldn't use is fetched in full next time.
    #[instrument(level = "trace", skip(self, parse))]
    async fn fetch<T>(
        &self,
        endpoint: Endpoint,
        parse: impl FnOnce(&str, &[u8]) -> Result<T>,
    ) -> Result<Fetched<T>> {
        let path = endpoint.path(self.node_id);
        let url = self.url(&path);
        let cached = self.etags()?.get(&endpoint).cloned();

        let response = self
            .send(&url, || {
                let request = self.http.get(self.url(&path));
                match &cached {
                    Some(etag) => request.header(IF_NONE_MATCH, etag),
                    None => request,
                }
            })
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            trace!("{} not modified", url);
            return Ok(Fetched::NotModified);
        }
        let response = Self::check_status(&url, response).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(|e| Error::Request {
            url: url.clone(),
            cause: Arc::new(e),
        })?;

        let value = parse(&url, &body)?;

        let mut etags = self.etags()?;
        match etag {
            Some(etag) => {
                etags.insert(endpoint, etag);
            }
            None => {
                etags.remove(&endpoint);
            }
        }
        Ok(Fetched::Fresh(value))
    }

    /// Post `data` to `path` as `{"data": [...]}`.
    async fn post<T: Serialize>(&self, path: &str, data: &[T]) -> Result<()> {
        let url = self.url(path);
        let body = PostData { data };
        let response = self
            .send(&url, || self.http.post(&url).json(&body))
            .await?;
        Self::check_status(&url, response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for PanelClient {
    fn describe(&self) -> ClientInfo {
        ClientInfo::new(self.api_host.clone(), self.node_id)
    }

    async fn fetch_node(&self) -> Result<Fetched<NodeDescriptor>> {
        let node_id = self.node_id;
        self.fetch(Endpoint::Server, |url, body| {
            let config: ServerConfig =
                serde_json::from_slice(body).map_err(|e| Error::invalid_response(url, e))?;
            NodeDescriptor::from_wire(node_id, config)
        })
        .await
    }

    async fn fetch_roster(&self) -> Result<Fetched<Vec<ServiceInfo>>> {
        self.fetch(Endpoint::Services, |url, body| {
            let parsed = serde_json::from_slice::<crate::model::ServiceList>(body)
                .map_err(|e| Error::invalid_response(url, e));
            // The counts from the last report are used by one parse only,
            // whether or not it succeeds.
            let mut last_online = self.last_online()?;
            let roster = parsed.map(|list| parse_roster_wire(list.services, &last_online));
            last_online.clear();
            roster
        })
        .await
    }

    async fn fetch_rules(&self) -> Result<Fetched<Vec<DetectRule>>> {
        self.fetch(Endpoint::Rules, |url, body| {
            let list: RuleList =
                serde_json::from_slice(body).map_err(|e| Error::invalid_response(url, e))?;
            Ok(compile_rules(&list.into_rules()))
        })
        .await
    }

    fn local_rules(&self) -> Vec<DetectRule> {
        self.local_rules.to_vec()
    }

    async fn report_traffic(&self, traffic: &[TrafficRecord]) -> Result<()> {
        let path = format!("/api/backend/service/traffic/{}", self.node_id);
        self.post(&path, traffic).await?;
        debug!("Reported traffic for {} users", traffic.len());
        Ok(())
    }

    async fn report_online(&self, online: &[OnlineRecord]) -> Result<()> {
        {
            let mut counts = HashMap::new();
            for record in online {
                *counts.entry(record.uid).or_insert(0_u32) += 1;
            }
            *self.last_online()? = counts;
        }
        let path = format!("/api/backend/service/online/{}", self.node_id);
        self.post(&path, online).await?;
        debug!("Reported {} online addresses", online.len());
        Ok(())
    }
}

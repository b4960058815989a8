use std::collections::HashMap;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::SourceSettings;
use crate::model::{AncestorRef, SourceIdentity, SourceNode};

pub const CONTENT_PAGE_LIMIT: usize = 100;
const CONTENT_EXPAND: &str = "ancestors,body.storage,history";
const MAX_READ_RETRIES: usize = 2;
const READ_RETRY_DELAY_MS: u64 = 500;

/// Read-only view of the source wiki.
pub trait SourceApi {
    /// Every page in `space_key`, creator identities carrying at least the
    /// account id.
    fn list_nodes(&mut self, space_key: &str) -> Result<Vec<SourceNode>>;
    fn resolve_identity(&mut self, account_id: &str) -> Result<SourceIdentity>;
    fn request_count(&self) -> usize;
}

/// List a space and fill in creator email/display name, one lookup per
/// distinct account. Enrichment failures keep the bare account id.
pub fn fetch_source_nodes<S: SourceApi>(api: &mut S, space_key: &str) -> Result<Vec<SourceNode>> {
    let mut nodes = api
        .list_nodes(space_key)
        .with_context(|| format!("failed to list source pages in space {space_key}"))?;

    let mut cache: HashMap<String, Option<SourceIdentity>> = HashMap::new();
    for node in &mut nodes {
        let Some(identity) = node.created_by.as_mut() else {
            continue;
        };
        if identity.account_id.is_empty() || identity.email.is_some() {
            continue;
        }
        let resolved = cache
            .entry(identity.account_id.clone())
            .or_insert_with(|| match api.resolve_identity(&identity.account_id) {
                Ok(resolved) => Some(resolved),
                Err(error) => {
                    warn!(
                        account_id = identity.account_id.as_str(),
                        error = %format!("{error:#}"),
                        "could not enrich source identity"
                    );
                    None
                }
            });
        if let Some(resolved) = resolved {
            if identity.email.is_none() {
                identity.email = resolved.email.clone();
            }
            if identity.display_name.is_none() {
                identity.display_name = resolved.display_name.clone();
            }
        }
    }
    info!(
        space_key,
        nodes = nodes.len(),
        identities = cache.len(),
        "fetched source pages"
    );
    Ok(nodes)
}

pub struct ConfluenceClient {
    client: Client,
    settings: SourceSettings,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self {
            client,
            settings,
            request_count: 0,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/wiki/rest/api/{}", self.settings.host, path)
    }

    /// `_links.next` is relative to the `/wiki` context path.
    fn next_url(&self, next: &str) -> String {
        if next.starts_with("http://") || next.starts_with("https://") {
            next.to_string()
        } else if next.starts_with("/wiki/") {
            format!("{}{}", self.settings.host, next)
        } else {
            format!("{}/wiki{}", self.settings.host, next)
        }
    }

    fn request_json_get<T: DeserializeOwned>(
        &mut self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        for attempt in 0..=MAX_READ_RETRIES {
            self.request_count += 1;
            let response = self
                .client
                .get(url)
                .basic_auth(&self.settings.email, Some(&self.settings.api_token))
                .header(USER_AGENT, self.settings.user_agent.clone())
                .query(query)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < MAX_READ_RETRIES && is_retryable_status(status) {
                            wait_before_retry(attempt);
                            continue;
                        }
                        bail!("Confluence API request to {url} failed with HTTP {status}");
                    }
                    return response
                        .json()
                        .context("failed to decode Confluence API JSON response");
                }
                Err(error) => {
                    if attempt < MAX_READ_RETRIES && (error.is_timeout() || error.is_connect()) {
                        wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call Confluence API");
                }
            }
        }

        bail!("Confluence API request exhausted retry budget")
    }
}

impl SourceApi for ConfluenceClient {
    fn list_nodes(&mut self, space_key: &str) -> Result<Vec<SourceNode>> {
        let mut nodes = Vec::new();
        let mut url = self.api_url("content");
        let mut query = vec![
            ("spaceKey", space_key.to_string()),
            ("type", "page".to_string()),
            ("start", "0".to_string()),
            ("limit", CONTENT_PAGE_LIMIT.to_string()),
            ("expand", CONTENT_EXPAND.to_string()),
        ];
        loop {
            let page: ContentPage = self.request_json_get(&url, &query)?;
            debug!(fetched = page.results.len(), "listed source pages");
            nodes.extend(page.results.into_iter().map(WireContent::into_node));
            match page.links.next {
                Some(next) if !next.is_empty() => {
                    // The next link already carries every query parameter.
                    url = self.next_url(&next);
                    query.clear();
                }
                _ => break,
            }
        }
        Ok(nodes)
    }

    fn resolve_identity(&mut self, account_id: &str) -> Result<SourceIdentity> {
        let url = self.api_url("user");
        let user: WireUser =
            self.request_json_get(&url, &[("accountId", account_id.to_string())])?;
        Ok(user.into_identity(account_id))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn wait_before_retry(attempt: usize) {
    let factor = u64::try_from(attempt + 1).unwrap_or(1);
    sleep(Duration::from_millis(READ_RETRY_DELAY_MS.saturating_mul(factor)));
}

#[derive(Debug, Deserialize)]
struct ContentPage {
    #[serde(default)]
    results: Vec<WireContent>,
    #[serde(rename = "_links", default)]
    links: PageLinks,
}

#[derive(Debug, Deserialize, Default)]
struct PageLinks {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    id: String,
    title: String,
    #[serde(default)]
    ancestors: Vec<WireAncestor>,
    #[serde(default)]
    body: Option<WireBody>,
    #[serde(default)]
    history: Option<WireHistory>,
}

#[derive(Debug, Deserialize)]
struct WireAncestor {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct WireBody {
    storage: Option<WireStorage>,
}

#[derive(Debug, Deserialize)]
struct WireStorage {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireHistory {
    #[serde(rename = "createdBy")]
    created_by: Option<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(rename = "accountId", default)]
    account_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
    #[serde(rename = "publicName", default)]
    public_name: Option<String>,
}

impl WireUser {
    fn into_identity(self, fallback_account_id: &str) -> SourceIdentity {
        SourceIdentity {
            account_id: self
                .account_id
                .unwrap_or_else(|| fallback_account_id.to_string()),
            email: self.email.filter(|email| !email.trim().is_empty()),
            display_name: self.display_name.or(self.public_name),
        }
    }
}

impl WireContent {
    fn into_node(self) -> SourceNode {
        let created_by = self
            .history
            .and_then(|history| history.created_by)
            .filter(|user| user.account_id.is_some())
            .map(|user| user.into_identity(""));
        SourceNode {
            id: self.id,
            title: self.title,
            ancestors: self
                .ancestors
                .into_iter()
                .map(|ancestor| AncestorRef {
                    id: ancestor.id,
                    title: ancestor.title,
                })
                .collect(),
            body: self
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
            created_by,
        }
    }
}

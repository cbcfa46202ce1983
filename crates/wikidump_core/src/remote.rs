use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::{Credentials, DumpConfig, Profile};
use crate::model::{Attachment, Node, NodeSummary, NodeVersion};

/// Page size used for every paginated listing call.
pub const PAGE_SIZE: usize = 200;

const NODE_EXPAND: &str = "body.export_view,body.view,version,ancestors,space,metadata.labels";
const SUMMARY_EXPAND: &str = "ancestors,metadata.labels";

/// Result of one remote read. Callers branch on the variant instead of
/// probing the payload for missing keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Found(T),
    Empty,
    AuthFailure(String),
    TransportError(String),
}

impl<T> FetchOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        match self {
            Self::Found(value) => FetchOutcome::Found(f(value)),
            Self::Empty => FetchOutcome::Empty,
            Self::AuthFailure(reason) => FetchOutcome::AuthFailure(reason),
            Self::TransportError(reason) => FetchOutcome::TransportError(reason),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> FetchOutcome<U>) -> FetchOutcome<U> {
        match self {
            Self::Found(value) => f(value),
            Self::Empty => FetchOutcome::Empty,
            Self::AuthFailure(reason) => FetchOutcome::AuthFailure(reason),
            Self::TransportError(reason) => FetchOutcome::TransportError(reason),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Found(_) => "ok".to_string(),
            Self::Empty => "no data".to_string(),
            Self::AuthFailure(reason) => format!("authentication failure: {reason}"),
            Self::TransportError(reason) => format!("transport error: {reason}"),
        }
    }
}

/// Read access to the remote corpus. Implementations never retry; every
/// failure is reported once through [`FetchOutcome`].
pub trait CorpusApi: Sync {
    fn fetch_node(&self, id: &str) -> FetchOutcome<Node>;
    /// All direct children of `id`, in remote order.
    fn fetch_children(&self, id: &str) -> FetchOutcome<Vec<NodeSummary>>;
    fn fetch_by_label(
        &self,
        label: &str,
        offset: usize,
        limit: usize,
    ) -> FetchOutcome<Vec<NodeSummary>>;
    fn fetch_by_collection(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> FetchOutcome<Vec<NodeSummary>>;
    fn fetch_collection_home(&self, key: &str) -> FetchOutcome<NodeSummary>;
    fn fetch_collections(&self, offset: usize, limit: usize) -> FetchOutcome<Vec<String>>;
    fn fetch_attachments(&self, id: &str) -> FetchOutcome<Vec<Attachment>>;

    fn download(&self, url: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub api_root: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub credentials: Credentials,
}

impl ConfluenceClientConfig {
    pub fn from_profile(
        config: &DumpConfig,
        profile: &Profile,
        base_url: &str,
        context_path_override: Option<&str>,
        credentials: Credentials,
    ) -> Self {
        Self {
            api_root: profile.api_root(base_url, context_path_override),
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
            credentials,
        }
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    request_count: AtomicUsize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: AtomicUsize::new(0),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("User-Agent", self.config.user_agent.clone());
        match &self.config.credentials {
            Credentials::Basic { user, token } => request.basic_auth(user, Some(token)),
            Credentials::Bearer { token } => request.bearer_auth(token),
            Credentials::Anonymous => request,
        }
    }

    fn request_json(&self, path: &str, params: &[(&str, String)]) -> FetchOutcome<Value> {
        let url = format!("{}{}", self.config.api_root, path);
        self.request_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("GET {url} {params:?}");

        let response = self
            .authorize(self.client.get(&url))
            .header("Accept", "application/json")
            .query(params)
            .send();
        let response = match response {
            Ok(response) => response,
            Err(error) => return FetchOutcome::TransportError(error.to_string()),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return FetchOutcome::AuthFailure(format!("HTTP {status} for {url}"));
        }
        if status == StatusCode::NOT_FOUND {
            return FetchOutcome::Empty;
        }
        if !status.is_success() {
            return FetchOutcome::TransportError(format!("HTTP {status} for {url}"));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("application/json") {
            return FetchOutcome::AuthFailure(format!(
                "non-JSON response ({content_type}) for {url}; check credentials, VPN or SSO policy"
            ));
        }

        match response.json::<Value>() {
            Ok(payload) => FetchOutcome::Found(payload),
            Err(error) => FetchOutcome::TransportError(format!(
                "failed to decode JSON response from {url}: {error}"
            )),
        }
    }

    fn request_typed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> FetchOutcome<T> {
        self.request_json(path, params)
            .and_then(|payload| match serde_json::from_value::<T>(payload) {
                Ok(parsed) => FetchOutcome::Found(parsed),
                Err(error) => FetchOutcome::TransportError(format!(
                    "unexpected response shape from {path}: {error}"
                )),
            })
    }

    fn search_page(&self, cql: String, offset: usize, limit: usize) -> FetchOutcome<Vec<NodeSummary>> {
        let params = vec![
            ("cql", cql),
            ("start", offset.to_string()),
            ("limit", limit.to_string()),
            ("expand", SUMMARY_EXPAND.to_string()),
        ];
        self.request_typed::<ListResponse<ContentItem>>("/content/search", &params)
            .map(|list| list.results.into_iter().map(summary_from_item).collect())
    }
}

impl CorpusApi for ConfluenceClient {
    fn fetch_node(&self, id: &str) -> FetchOutcome<Node> {
        let params = vec![("expand", NODE_EXPAND.to_string())];
        self.request_json(&format!("/content/{id}"), &params)
            .and_then(|payload| match node_from_value(payload) {
                Ok(node) => FetchOutcome::Found(node),
                Err(error) => FetchOutcome::TransportError(format!("{error:#}")),
            })
    }

    fn fetch_children(&self, id: &str) -> FetchOutcome<Vec<NodeSummary>> {
        let mut children = Vec::new();
        let mut offset = 0usize;
        loop {
            let cql = format!("type=page AND parent={id}");
            match self.search_page(cql, offset, PAGE_SIZE) {
                FetchOutcome::Found(page) => {
                    if page.is_empty() {
                        break;
                    }
                    let page_len = page.len();
                    children.extend(page.into_iter().map(|mut child| {
                        child.parent_id = Some(id.to_string());
                        child
                    }));
                    if page_len < PAGE_SIZE {
                        break;
                    }
                    offset += page_len;
                }
                FetchOutcome::Empty => break,
                failure if children.is_empty() => return failure,
                failure => {
                    tracing::warn!(
                        "children of {id} truncated after {} entries: {}",
                        children.len(),
                        failure.describe()
                    );
                    break;
                }
            }
        }
        FetchOutcome::Found(children)
    }

    fn fetch_by_label(
        &self,
        label: &str,
        offset: usize,
        limit: usize,
    ) -> FetchOutcome<Vec<NodeSummary>> {
        let cql = format!("label=\"{}\"", label.replace('"', "\\\""));
        self.search_page(cql, offset, limit)
    }

    fn fetch_by_collection(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> FetchOutcome<Vec<NodeSummary>> {
        let cql = format!("type=page AND space=\"{}\"", key.replace('"', "\\\""));
        self.search_page(cql, offset, limit)
    }

    fn fetch_collection_home(&self, key: &str) -> FetchOutcome<NodeSummary> {
        let params = vec![("expand", "homepage".to_string())];
        self.request_typed::<SpaceItem>(&format!("/space/{key}"), &params)
            .and_then(|space| match space.homepage {
                Some(home) => FetchOutcome::Found(NodeSummary {
                    id: home.id,
                    title: home.title,
                    parent_id: None,
                    labels: Vec::new(),
                }),
                None => FetchOutcome::Empty,
            })
    }

    fn fetch_collections(&self, offset: usize, limit: usize) -> FetchOutcome<Vec<String>> {
        let params = vec![
            ("start", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        self.request_typed::<ListResponse<SpaceItem>>("/space", &params)
            .map(|list| list.results.into_iter().map(|space| space.key).collect())
    }

    fn fetch_attachments(&self, id: &str) -> FetchOutcome<Vec<Attachment>> {
        collect_attachments(id, |offset| {
            let params = vec![
                ("start", offset.to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            self.request_typed::<ListResponse<AttachmentItem>>(
                &format!("/content/{id}/child/attachment"),
                &params,
            )
        })
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let response = self
            .authorize(self.client.get(url))
            .send()
            .with_context(|| format!("failed to download {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} while downloading {}", status.as_u16(), url);
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok(bytes.to_vec())
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

/// Decode a full content record (`/content/{id}` with [`NODE_EXPAND`]).
pub fn node_from_value(value: Value) -> Result<Node> {
    let item: ContentItem = serde_json::from_value(value.clone())
        .context("failed to decode content record")?;
    let body = item
        .body
        .as_ref()
        .and_then(|body| {
            body.export_view
                .as_ref()
                .map(|view| view.value.clone())
                .filter(|value| !value.is_empty())
                .or_else(|| body.view.as_ref().map(|view| view.value.clone()))
        })
        .unwrap_or_default();
    let version = item.version.as_ref().map(|version| NodeVersion {
        by: version
            .by
            .as_ref()
            .and_then(|user| user.display_name.clone()),
        when: version.when.clone(),
    });
    let view_url = match (&item.links.base, &item.links.webui) {
        (Some(base), Some(webui)) => Some(format!("{}{}", base.trim_end_matches('/'), webui)),
        _ => None,
    };
    let collection_key = item.space.as_ref().and_then(|space| space.key.clone());
    let summary = summary_from_item(item);

    Ok(Node {
        id: summary.id,
        title: summary.title,
        parent_id: summary.parent_id,
        labels: summary.labels,
        body,
        version,
        collection_key,
        view_url,
        raw: value,
    })
}

fn summary_from_item(item: ContentItem) -> NodeSummary {
    let parent_id = item.ancestors.last().map(|ancestor| ancestor.id.clone());
    let labels = item
        .metadata
        .and_then(|metadata| metadata.labels)
        .map(|labels| labels.results.into_iter().map(|label| label.name).collect())
        .unwrap_or_default();
    NodeSummary {
        id: item.id,
        title: item.title,
        parent_id,
        labels,
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    ancestors: Vec<AncestorItem>,
    metadata: Option<MetadataPayload>,
    version: Option<VersionPayload>,
    body: Option<BodyPayload>,
    space: Option<SpaceRef>,
    #[serde(default, rename = "_links")]
    links: LinksPayload,
}

#[derive(Debug, Deserialize)]
struct AncestorItem {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MetadataPayload {
    labels: Option<LabelsPayload>,
}

#[derive(Debug, Deserialize)]
struct LabelsPayload {
    #[serde(default)]
    results: Vec<LabelItem>,
}

#[derive(Debug, Deserialize)]
struct LabelItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    by: Option<UserPayload>,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BodyPayload {
    export_view: Option<BodyValue>,
    view: Option<BodyValue>,
}

#[derive(Debug, Deserialize)]
struct BodyValue {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct SpaceRef {
    key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LinksPayload {
    webui: Option<String>,
    download: Option<String>,
    base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpaceItem {
    key: String,
    homepage: Option<HomepageItem>,
}

#[derive(Debug, Deserialize)]
struct HomepageItem {
    id: String,
    #[serde(default)]
    title: String,
}

/// Walk attachment listing pages from offset 0. A failure on the first page
/// is the outcome; a later failure keeps what was already listed.
fn collect_attachments<F>(id: &str, mut fetch_page: F) -> FetchOutcome<Vec<Attachment>>
where
    F: FnMut(usize) -> FetchOutcome<ListResponse<AttachmentItem>>,
{
    let mut attachments = Vec::new();
    let mut offset = 0usize;
    loop {
        match fetch_page(offset) {
            FetchOutcome::Found(list) => {
                let page_len = list.results.len();
                attachments.extend(list.results.into_iter().filter_map(|item| {
                    let download_path = item.links.download?;
                    Some(Attachment {
                        title: item.title,
                        download_path,
                    })
                }));
                if page_len < PAGE_SIZE {
                    break;
                }
                offset += page_len;
            }
            FetchOutcome::Empty => break,
            failure if attachments.is_empty() => return failure.map(|_| Vec::new()),
            failure => {
                tracing::warn!("attachment list of {id} truncated: {}", failure.describe());
                break;
            }
        }
    }
    FetchOutcome::Found(attachments)
}

#[derive(Debug, Deserialize)]
struct AttachmentItem {
    #[serde(default)]
    title: String,
    #[serde(default, rename = "_links")]
    links: LinksPayload,
}

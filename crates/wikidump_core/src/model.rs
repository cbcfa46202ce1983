use serde::Serialize;
use serde_json::Value;

/// One exportable content item as returned by a full fetch.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub labels: Vec<String>,
    pub body: String,
    pub version: Option<NodeVersion>,
    pub collection_key: Option<String>,
    pub view_url: Option<String>,
    /// Remote record as received, persisted in the metadata sidecar.
    #[serde(skip)]
    pub raw: Value,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NodeVersion {
    pub by: Option<String>,
    pub when: Option<String>,
}

/// Light record returned by listing calls (children, label and collection queries).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeSummary {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub labels: Vec<String>,
}

impl NodeSummary {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|candidate| candidate == label)
    }
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            title: node.title.clone(),
            parent_id: node.parent_id.clone(),
            labels: node.labels.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Attachment {
    pub title: String,
    pub download_path: String,
}

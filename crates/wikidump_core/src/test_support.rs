//! In-memory corpus used by the unit tests of every pipeline stage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{Result, bail};
use serde_json::json;

use crate::model::{Attachment, Node, NodeSummary, NodeVersion};
use crate::remote::{CorpusApi, FetchOutcome};

#[derive(Default)]
pub struct MockApi {
    pub nodes: BTreeMap<String, Node>,
    pub children: BTreeMap<String, Vec<String>>,
    pub collection_homes: BTreeMap<String, String>,
    pub collection_pages: BTreeMap<String, Vec<String>>,
    pub collections: Vec<String>,
    pub attachments: BTreeMap<String, Vec<Attachment>>,
    pub downloads: BTreeMap<String, Vec<u8>>,
    pub failing_nodes: BTreeSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl MockApi {
    /// Register a node; `parent` also appends it to the parent's child list.
    pub fn with_node(mut self, id: &str, title: &str, parent: Option<&str>) -> Self {
        let body = format!("<p>{title} body</p>");
        self.insert_node(id, title, parent, &body, &[]);
        self
    }

    pub fn with_labeled_node(
        mut self,
        id: &str,
        title: &str,
        parent: Option<&str>,
        labels: &[&str],
    ) -> Self {
        let body = format!("<p>{title} body</p>");
        self.insert_node(id, title, parent, &body, labels);
        self
    }

    pub fn with_body(mut self, id: &str, body: &str) -> Self {
        if let Some(node) = self.nodes.get_mut(id) {
            node.body = body.to_string();
        }
        self
    }

    pub fn insert_node(
        &mut self,
        id: &str,
        title: &str,
        parent: Option<&str>,
        body: &str,
        labels: &[&str],
    ) {
        let node = Node {
            id: id.to_string(),
            title: title.to_string(),
            parent_id: parent.map(ToString::to_string),
            labels: labels.iter().map(ToString::to_string).collect(),
            body: body.to_string(),
            version: Some(NodeVersion {
                by: Some("Ada Lovelace".to_string()),
                when: Some("2024-03-01T10:20:30.000Z".to_string()),
            }),
            collection_key: Some("DOCS".to_string()),
            view_url: Some(format!("https://wiki.example.org/pages/{id}")),
            raw: json!({"id": id, "title": title}),
        };
        self.nodes.insert(id.to_string(), node);
        if let Some(parent) = parent {
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(id.to_string());
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn children_fetched_for(&self, id: &str) -> bool {
        let needle = format!("children:{id}");
        self.calls().iter().any(|call| call == &needle)
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn summary(&self, id: &str) -> Option<NodeSummary> {
        self.nodes.get(id).map(NodeSummary::from)
    }

    fn page_of(&self, ids: &[String], offset: usize, limit: usize) -> Vec<NodeSummary> {
        ids.iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| self.summary(id))
            .collect()
    }
}

impl CorpusApi for MockApi {
    fn fetch_node(&self, id: &str) -> FetchOutcome<Node> {
        self.record(format!("node:{id}"));
        if self.failing_nodes.contains(id) {
            return FetchOutcome::TransportError("simulated outage".to_string());
        }
        match self.nodes.get(id) {
            Some(node) => FetchOutcome::Found(node.clone()),
            None => FetchOutcome::Empty,
        }
    }

    fn fetch_children(&self, id: &str) -> FetchOutcome<Vec<NodeSummary>> {
        self.record(format!("children:{id}"));
        let children = self
            .children
            .get(id)
            .map(|ids| ids.iter().filter_map(|child| self.summary(child)).collect())
            .unwrap_or_default();
        FetchOutcome::Found(children)
    }

    fn fetch_by_label(
        &self,
        label: &str,
        offset: usize,
        limit: usize,
    ) -> FetchOutcome<Vec<NodeSummary>> {
        self.record(format!("label:{label}:{offset}"));
        let ids = self
            .nodes
            .values()
            .filter(|node| node.labels.iter().any(|candidate| candidate == label))
            .map(|node| node.id.clone())
            .collect::<Vec<_>>();
        FetchOutcome::Found(self.page_of(&ids, offset, limit))
    }

    fn fetch_by_collection(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> FetchOutcome<Vec<NodeSummary>> {
        self.record(format!("collection:{key}:{offset}"));
        match self.collection_pages.get(key) {
            Some(ids) => FetchOutcome::Found(self.page_of(ids, offset, limit)),
            None => FetchOutcome::Empty,
        }
    }

    fn fetch_collection_home(&self, key: &str) -> FetchOutcome<NodeSummary> {
        self.record(format!("home:{key}"));
        match self
            .collection_homes
            .get(key)
            .and_then(|id| self.summary(id))
        {
            Some(home) => FetchOutcome::Found(home),
            None => FetchOutcome::Empty,
        }
    }

    fn fetch_collections(&self, offset: usize, limit: usize) -> FetchOutcome<Vec<String>> {
        FetchOutcome::Found(
            self.collections
                .iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
        )
    }

    fn fetch_attachments(&self, id: &str) -> FetchOutcome<Vec<Attachment>> {
        self.record(format!("attachments:{id}"));
        FetchOutcome::Found(self.attachments.get(id).cloned().unwrap_or_default())
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.record(format!("download:{url}"));
        match self.downloads.get(url) {
            Some(bytes) => Ok(bytes.clone()),
            None => bail!("HTTP 404 while downloading {url}"),
        }
    }

    fn request_count(&self) -> usize {
        self.calls().len()
    }
}

/// A -> [B -> [D], C]
pub fn abcd_corpus() -> MockApi {
    MockApi::default()
        .with_node("A", "Alpha", None)
        .with_node("B", "Beta", Some("A"))
        .with_node("D", "Delta", Some("B"))
        .with_node("C", "Gamma", Some("A"))
}

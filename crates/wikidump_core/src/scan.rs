use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::model::NodeSummary;
use crate::remote::{CorpusApi, FetchOutcome, PAGE_SIZE};

const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
}

/// Insertion-ordered metadata projection. Re-recording a known id is a no-op.
#[derive(Debug, Clone, Default)]
pub struct MetadataIndex {
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
}

impl MetadataIndex {
    /// Returns `false` when the id was already indexed.
    pub fn record(&mut self, entry: IndexEntry) -> bool {
        if entry.id.is_empty() || self.positions.contains_key(&entry.id) {
            return false;
        }
        self.positions.insert(entry.id.clone(), self.entries.len());
        self.entries.push(entry);
        true
    }

    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.positions.get(id).map(|position| &self.entries[*position])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanRules {
    pub exclude_ids: BTreeSet<String>,
    /// Prunes descendants carrying this label. Never applied to scan roots.
    pub exclude_label: Option<String>,
}

impl ScanRules {
    fn excludes_id(&self, id: &str) -> bool {
        self.exclude_ids.contains(id)
    }

    fn excludes_child(&self, child: &NodeSummary) -> bool {
        self.exclude_label
            .as_deref()
            .is_some_and(|label| child.has_label(label))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Single { id: String },
    Tree { root_id: String },
    Collection { key: String },
    LabelForest { label: String },
}

impl Strategy {
    pub fn describe(&self) -> String {
        match self {
            Self::Single { id } => format!("single page {id}"),
            Self::Tree { root_id } => format!("tree from page {root_id}"),
            Self::Collection { key } => format!("space {key}"),
            Self::LabelForest { label } => format!("label forest '{label}'"),
        }
    }

    /// Collection exports get the `mode: space` directive in their outline.
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Collection { .. })
    }
}

/// Ordered, deduplicated scan result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub ordered: Vec<String>,
    pub targets: BTreeSet<String>,
}

impl Inventory {
    fn from_ordered(ordered: Vec<String>) -> Self {
        let ordered = dedupe_first_occurrence(ordered);
        let targets = ordered.iter().cloned().collect();
        Self { ordered, targets }
    }
}

/// State of one inventory run. Construct a fresh session per collection.
#[derive(Debug, Default)]
pub struct ScanSession {
    pub index: MetadataIndex,
    scanned: usize,
}

impl ScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scanned(&self) -> usize {
        self.scanned
    }

    pub fn scan<A: CorpusApi + ?Sized>(
        &mut self,
        api: &A,
        strategy: &Strategy,
        rules: &ScanRules,
    ) -> Inventory {
        tracing::info!("inventory scan: {}", strategy.describe());
        let ordered = match strategy {
            Strategy::Single { id } => self.scan_single(api, id),
            Strategy::Tree { root_id } => self.scan_tree(api, root_id, rules),
            Strategy::Collection { key } => self.scan_collection(api, key, rules),
            Strategy::LabelForest { label } => self.scan_label_forest(api, label, rules),
        };
        let inventory = Inventory::from_ordered(ordered);
        tracing::info!("inventory complete: {} pages", inventory.ordered.len());
        inventory
    }

    fn scan_single<A: CorpusApi + ?Sized>(&mut self, api: &A, id: &str) -> Vec<String> {
        match api.fetch_node(id) {
            FetchOutcome::Found(node) => {
                self.record_summary(&NodeSummary::from(&node));
            }
            failure => {
                tracing::warn!("could not fetch page {id}: {}", failure.describe());
                self.index.record(IndexEntry {
                    id: id.to_string(),
                    title: format!("Page {id}"),
                    parent_id: None,
                });
            }
        }
        vec![id.to_string()]
    }

    fn scan_tree<A: CorpusApi + ?Sized>(
        &mut self,
        api: &A,
        root_id: &str,
        rules: &ScanRules,
    ) -> Vec<String> {
        if rules.excludes_id(root_id) {
            tracing::warn!("[excluded by id] root page {root_id} is excluded; nothing to scan");
            return Vec::new();
        }
        let root = match api.fetch_node(root_id) {
            FetchOutcome::Found(node) => NodeSummary::from(&node),
            failure => {
                tracing::warn!("could not fetch root page {root_id}: {}", failure.describe());
                return Vec::new();
            }
        };
        self.record_summary(&root);
        let mut ordered = Vec::new();
        self.expand(api, root_id, rules, &mut ordered);
        ordered
    }

    fn scan_collection<A: CorpusApi + ?Sized>(
        &mut self,
        api: &A,
        key: &str,
        rules: &ScanRules,
    ) -> Vec<String> {
        let roots = match api.fetch_collection_home(key) {
            FetchOutcome::Found(home) => vec![home],
            FetchOutcome::Empty => {
                tracing::warn!(
                    "space {key} has no home page; using its top-level pages as roots"
                );
                self.collection_top_level(api, key)
            }
            failure => {
                tracing::warn!("could not find home page of space {key}: {}", failure.describe());
                return Vec::new();
            }
        };

        let rules = ScanRules {
            exclude_label: None,
            ..rules.clone()
        };
        let mut ordered = Vec::new();
        for root in roots {
            if rules.excludes_id(&root.id) {
                tracing::warn!("[excluded by id] pruning tree at page {}", root.id);
                continue;
            }
            self.record_summary(&root);
            self.expand(api, &root.id, &rules, &mut ordered);
        }
        ordered
    }

    fn collection_top_level<A: CorpusApi + ?Sized>(&self, api: &A, key: &str) -> Vec<NodeSummary> {
        let mut roots = Vec::new();
        let mut offset = 0usize;
        loop {
            match api.fetch_by_collection(key, offset, PAGE_SIZE) {
                FetchOutcome::Found(page) if !page.is_empty() => {
                    offset += page.len();
                    roots.extend(page.into_iter().filter(|node| node.parent_id.is_none()));
                }
                FetchOutcome::Found(_) | FetchOutcome::Empty => break,
                failure => {
                    tracing::warn!("listing space {key} failed: {}", failure.describe());
                    break;
                }
            }
        }
        roots
    }

    fn scan_label_forest<A: CorpusApi + ?Sized>(
        &mut self,
        api: &A,
        label: &str,
        rules: &ScanRules,
    ) -> Vec<String> {
        let mut roots = Vec::new();
        let mut offset = 0usize;
        loop {
            match api.fetch_by_label(label, offset, PAGE_SIZE) {
                FetchOutcome::Found(page) if !page.is_empty() => {
                    offset += page.len();
                    roots.extend(page.into_iter().filter(|root| !rules.excludes_id(&root.id)));
                }
                FetchOutcome::Found(_) | FetchOutcome::Empty => break,
                failure => {
                    tracing::warn!("label query '{label}' failed: {}", failure.describe());
                    break;
                }
            }
        }
        tracing::info!("label '{label}' matched {} root pages", roots.len());

        let mut forest = Vec::new();
        for root in roots {
            self.record_summary(&root);
            if forest.contains(&root.id) {
                // Already expanded beneath an earlier root with the same rules.
                continue;
            }
            let mut branch = Vec::new();
            self.expand(api, &root.id, rules, &mut branch);
            forest.extend(branch);
        }
        forest
    }

    /// Pre-order expansion: `id` first, then each surviving child's subtree in
    /// remote order. Excluded ids are pruned before their children are fetched.
    fn expand<A: CorpusApi + ?Sized>(
        &mut self,
        api: &A,
        id: &str,
        rules: &ScanRules,
        ordered: &mut Vec<String>,
    ) {
        if rules.excludes_id(id) {
            tracing::warn!("[excluded by id] pruning tree at page {id}");
            return;
        }

        ordered.push(id.to_string());
        self.scanned += 1;
        if self.scanned % PROGRESS_EVERY == 0 {
            tracing::info!("scanned {} pages...", self.scanned);
        }

        let children = match api.fetch_children(id) {
            FetchOutcome::Found(children) => children,
            FetchOutcome::Empty => return,
            failure => {
                tracing::warn!("could not list children of {id}: {}", failure.describe());
                return;
            }
        };

        for child in children {
            if rules.excludes_id(&child.id) {
                tracing::warn!("[excluded by id] pruning tree at page {}", child.id);
                continue;
            }
            if rules.excludes_child(&child) {
                tracing::warn!(
                    "[excluded by label '{}'] pruning tree at page {}",
                    rules.exclude_label.as_deref().unwrap_or_default(),
                    child.id
                );
                continue;
            }
            self.index.record(IndexEntry {
                id: child.id.clone(),
                title: child.title.clone(),
                parent_id: Some(id.to_string()),
            });
            self.expand(api, &child.id, rules, ordered);
        }
    }

    fn record_summary(&mut self, summary: &NodeSummary) {
        self.index.record(IndexEntry {
            id: summary.id.clone(),
            title: summary.title.clone(),
            parent_id: summary.parent_id.clone(),
        });
    }
}

/// Keep the first occurrence of every id, preserving order.
pub fn dedupe_first_occurrence(values: Vec<String>) -> Vec<String> {
    let mut output = Vec::with_capacity(values.len());
    let mut seen = HashSet::new();
    for value in values {
        if seen.insert(value.clone()) {
            output.push(value);
        }
    }
    output
}

/// Page through the collection listing until an empty page.
pub fn list_collections<A: CorpusApi + ?Sized>(api: &A) -> Vec<String> {
    let mut keys = Vec::new();
    let mut offset = 0usize;
    loop {
        match api.fetch_collections(offset, PAGE_SIZE) {
            FetchOutcome::Found(page) if !page.is_empty() => {
                offset += page.len();
                keys.extend(page);
            }
            FetchOutcome::Found(_) | FetchOutcome::Empty => break,
            failure => {
                tracing::warn!("listing spaces failed: {}", failure.describe());
                break;
            }
        }
    }
    keys
}

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::scan::MetadataIndex;

/// Parent/children structure of the exported ids. Child order follows index
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forest {
    pub roots: Vec<String>,
    pub children: BTreeMap<String, Vec<String>>,
    pub titles: BTreeMap<String, String>,
}

impl Forest {
    /// A node is a root iff its parent is absent or outside `targets`.
    pub fn build(index: &MetadataIndex, targets: &BTreeSet<String>) -> Self {
        let included = index
            .entries()
            .iter()
            .filter(|entry| targets.contains(&entry.id))
            .map(|entry| entry.id.as_str())
            .collect::<HashSet<_>>();

        let mut forest = Self::default();
        for entry in index.entries() {
            if !included.contains(entry.id.as_str()) {
                continue;
            }
            forest.titles.insert(entry.id.clone(), entry.title.clone());
            match entry.parent_id.as_deref() {
                Some(parent) if included.contains(parent) && parent != entry.id => {
                    forest
                        .children
                        .entry(parent.to_string())
                        .or_default()
                        .push(entry.id.clone());
                }
                _ => forest.roots.push(entry.id.clone()),
            }
        }
        forest
    }

    /// Forest over every indexed node.
    pub fn build_all(index: &MetadataIndex) -> Self {
        Self::build(index, &index.ids())
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn title_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.titles.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::Forest;
    use crate::scan::{IndexEntry, MetadataIndex, ScanRules, ScanSession, Strategy};
    use crate::test_support::abcd_corpus;

    fn entry(id: &str, parent: Option<&str>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            title: format!("Title {id}"),
            parent_id: parent.map(ToString::to_string),
        }
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(ToString::to_string).collect()
    }

    /// Every target appears exactly once, as a root or as the child of an
    /// included parent.
    fn assert_forest_invariant(forest: &Forest, targets: &BTreeSet<String>) {
        let mut placements = forest.roots.clone();
        for (parent, children) in &forest.children {
            assert!(targets.contains(parent), "parent {parent} outside targets");
            placements.extend(children.iter().cloned());
        }
        let unique = placements.iter().cloned().collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), placements.len(), "duplicate placement");
        assert_eq!(&unique, targets);
    }

    #[test]
    fn empty_index_builds_empty_forest() {
        let forest = Forest::build(&MetadataIndex::default(), &BTreeSet::new());
        assert!(forest.is_empty());
        assert!(forest.roots.is_empty());
    }

    #[test]
    fn scanned_tree_builds_expected_forest() {
        let api = abcd_corpus();
        let mut session = ScanSession::new();
        let inventory = session.scan(
            &api,
            &Strategy::Tree {
                root_id: "A".to_string(),
            },
            &ScanRules::default(),
        );
        let forest = Forest::build(&session.index, &inventory.targets);
        assert_eq!(forest.roots, vec!["A"]);
        assert_eq!(forest.children_of("A"), ["B", "C"]);
        assert_eq!(forest.children_of("B"), ["D"]);
        assert!(forest.children_of("D").is_empty());
        assert_eq!(forest.title_of("C"), "Gamma");
        assert_forest_invariant(&forest, &inventory.targets);
    }

    #[test]
    fn nodes_with_parent_outside_targets_become_roots() {
        let mut index = MetadataIndex::default();
        for (id, parent) in [("1", None), ("2", Some("1")), ("3", Some("2")), ("4", Some("1"))] {
            index.record(entry(id, parent));
        }
        let targets = ids(&["2", "3", "4"]);
        let forest = Forest::build(&index, &targets);
        assert_eq!(forest.roots, vec!["2", "4"]);
        assert_eq!(forest.children_of("2"), ["3"]);
        assert_forest_invariant(&forest, &targets);
    }

    #[test]
    fn child_order_follows_insertion_not_title() {
        let mut index = MetadataIndex::default();
        index.record(entry("root", None));
        index.record(IndexEntry {
            id: "z".to_string(),
            title: "Zulu".to_string(),
            parent_id: Some("root".to_string()),
        });
        index.record(IndexEntry {
            id: "a".to_string(),
            title: "Alpha".to_string(),
            parent_id: Some("root".to_string()),
        });
        let forest = Forest::build_all(&index);
        assert_eq!(forest.children_of("root"), ["z", "a"]);
    }

    #[test]
    fn targets_missing_from_index_are_ignored() {
        let mut index = MetadataIndex::default();
        index.record(entry("1", None));
        let forest = Forest::build(&index, &ids(&["1", "ghost"]));
        assert_eq!(forest.roots, vec!["1"]);
        assert_eq!(forest.len(), 1);
    }
}

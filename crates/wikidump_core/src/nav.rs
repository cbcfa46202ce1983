use std::sync::OnceLock;

use maud::{Markup, html};
use regex::Regex;

use crate::html::percent_decode;
use crate::tree::Forest;

pub const SIDEBAR_START: &str = "<!-- WIKIDUMP-SIDEBAR-START -->";
pub const SIDEBAR_END: &str = "<!-- WIKIDUMP-SIDEBAR-END -->";
pub const ACTIVE_CLASS: &str = "active-page";
pub const SPACE_MODE_DIRECTIVE: &str = "<!-- mode: space -->";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavNode {
    pub title: String,
    pub href: Option<String>,
    pub children: Vec<NavNode>,
}

impl NavNode {
    /// Percent-decoded file name of the href, ignoring scheme, query and fragment.
    pub fn file_name(&self) -> Option<String> {
        let href = self.href.as_deref()?.trim();
        let path = match reqwest::Url::parse(href) {
            Ok(url) => url.path().to_string(),
            Err(_) => href
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        let path = percent_decode(&path);
        let file_name = path.rsplit('/').next().unwrap_or_default();
        (!file_name.is_empty()).then(|| file_name.to_string())
    }

    /// Node id carried in the href's file name stem.
    pub fn page_id(&self) -> Option<String> {
        let file_name = self.file_name()?;
        let stem = match file_name.rfind('.') {
            Some(dot) if dot > 0 => &file_name[..dot],
            _ => file_name.as_str(),
        };
        (!stem.is_empty()).then(|| stem.to_string())
    }

    fn count(&self) -> usize {
        1 + self.children.iter().map(NavNode::count).sum::<usize>()
    }
}

/// Navigation tree: the children of an implicit root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavTree {
    pub roots: Vec<NavNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapOutcome {
    Unwrapped { promoted: usize },
    Skipped { top_level: usize },
}

/// How folders render: the live export opens top-level folders, patched
/// pages start fully closed. The active path is opened in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    RootsOpen,
    AllClosed,
}

impl NavTree {
    /// Hrefs become `{href_prefix}{id}.html`.
    pub fn from_forest(forest: &Forest, href_prefix: &str) -> Self {
        let roots = forest
            .roots
            .iter()
            .map(|id| nav_node_for(forest, id, href_prefix))
            .collect();
        Self { roots }
    }

    pub fn len(&self) -> usize {
        self.roots.iter().map(NavNode::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Promote the children of a single top-level node.
    pub fn unwrap_single_root(&mut self) -> UnwrapOutcome {
        if self.roots.len() != 1 {
            return UnwrapOutcome::Skipped {
                top_level: self.roots.len(),
            };
        }
        let root = self.roots.remove(0);
        self.roots = root.children;
        UnwrapOutcome::Unwrapped {
            promoted: self.roots.len(),
        }
    }

    pub fn render_fragment(&self, state: FolderState, active_id: Option<&str>) -> Markup {
        let active_path = active_id
            .and_then(|id| find_path(&self.roots, id))
            .unwrap_or_default();
        html! {
            div.sidebar-tree {
                ul {
                    @for (index, node) in self.roots.iter().enumerate() {
                        (render_node(node, state, 0, path_below(&active_path, index)))
                    }
                }
            }
        }
    }

    /// `- [title](href)` lines, two spaces per depth.
    pub fn render_outline(&self, space_mode: bool) -> String {
        let mut lines = Vec::new();
        if space_mode {
            lines.push(SPACE_MODE_DIRECTIVE.to_string());
        }
        for node in &self.roots {
            push_outline_lines(node, 0, &mut lines);
        }
        let mut output = lines.join("\n");
        output.push('\n');
        output
    }
}

fn nav_node_for(forest: &Forest, id: &str, href_prefix: &str) -> NavNode {
    NavNode {
        title: forest.title_of(id).to_string(),
        href: Some(format!("{href_prefix}{id}.html")),
        children: forest
            .children_of(id)
            .iter()
            .map(|child| nav_node_for(forest, child, href_prefix))
            .collect(),
    }
}

/// Index path to the first node whose page id is `id`.
fn find_path(nodes: &[NavNode], id: &str) -> Option<Vec<usize>> {
    for (index, node) in nodes.iter().enumerate() {
        if node.page_id().as_deref() == Some(id) {
            return Some(vec![index]);
        }
        if let Some(mut below) = find_path(&node.children, id) {
            below.insert(0, index);
            return Some(below);
        }
    }
    None
}

/// Remaining active path for child `index`, if the path runs through it.
fn path_below(path: &[usize], index: usize) -> Option<&[usize]> {
    match path.split_first() {
        Some((head, rest)) if *head == index => Some(rest),
        _ => None,
    }
}

fn render_node(
    node: &NavNode,
    state: FolderState,
    depth: usize,
    active: Option<&[usize]>,
) -> Markup {
    let is_active = active.is_some_and(<[usize]>::is_empty);
    let on_path = active.is_some();
    let page_href = node.page_id().map(|id| format!("{id}.html"));
    let link_class = is_active.then_some(ACTIVE_CLASS);

    if node.children.is_empty() {
        return html! {
            li.leaf {
                @if let Some(href) = &page_href {
                    a href=(href) class=[link_class] { (node.title) }
                } @else {
                    span { (node.title) }
                }
            }
        };
    }

    let open = on_path || (state == FolderState::RootsOpen && depth == 0);
    let child_path = active.unwrap_or_default();
    html! {
        li.folder {
            details open[open] {
                summary {
                    @if let Some(href) = &page_href {
                        a href=(href) class=[link_class] { (node.title) }
                    } @else {
                        (node.title)
                    }
                }
                ul {
                    @for (index, child) in node.children.iter().enumerate() {
                        (render_node(child, state, depth + 1, path_below(child_path, index)))
                    }
                }
            }
        }
    }
}

fn push_outline_lines(node: &NavNode, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    match &node.href {
        Some(href) => lines.push(format!("{indent}- [{}]({href})", node.title)),
        None => lines.push(format!("{indent}- {}", node.title)),
    }
    for child in &node.children {
        push_outline_lines(child, depth + 1, lines);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutline {
    pub tree: NavTree,
    pub mode: Option<String>,
}

impl ParsedOutline {
    pub fn wants_unwrap(&self) -> bool {
        self.mode.as_deref() == Some("space")
    }
}

/// Parse outline text back into a tree. Lines that are neither directives
/// nor `-` items are ignored.
pub fn parse_outline(text: &str) -> ParsedOutline {
    let mut mode = None;
    let mut stack: Vec<(isize, NavNode)> = vec![(-1, NavNode::default())];

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.starts_with("<!--") {
            if let Some((key, value)) = parse_directive(stripped)
                && key == "mode"
            {
                mode = Some(value);
            }
            continue;
        }
        if !stripped.starts_with('-') {
            continue;
        }

        let indent = &line[..line.find('-').unwrap_or_default()];
        let level = (indent.matches('\t').count() + indent.matches(' ').count() / 2) as isize;
        let node = parse_item(stripped[1..].trim());

        while stack.len() > 1 && stack.last().is_some_and(|(top, _)| *top >= level) {
            attach_top(&mut stack);
        }
        stack.push((level, node));
    }
    while stack.len() > 1 {
        attach_top(&mut stack);
    }

    let roots = stack
        .pop()
        .map(|(_, root)| root.children)
        .unwrap_or_default();
    ParsedOutline {
        tree: NavTree { roots },
        mode,
    }
}

fn attach_top(stack: &mut Vec<(isize, NavNode)>) {
    if let Some((_, node)) = stack.pop()
        && let Some((_, parent)) = stack.last_mut()
    {
        parent.children.push(node);
    }
}

fn parse_directive(line: &str) -> Option<(String, String)> {
    let body = line.strip_prefix("<!--")?;
    let body = body.split("-->").next().unwrap_or(body).trim();
    let (key, value) = body.split_once(':')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

fn parse_item(content: &str) -> NavNode {
    match link_pattern().captures(content) {
        Some(captures) => NavNode {
            title: captures[1].to_string(),
            href: Some(captures[2].to_string()),
            children: Vec::new(),
        },
        None => NavNode {
            title: content.to_string(),
            href: None,
            children: Vec::new(),
        },
    }
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\[(.*)\]\((.*)\)$").expect("link pattern compiles"))
}

#[cfg(test)]
mod tests {
    use super::{FolderState, NavNode, NavTree, UnwrapOutcome, parse_outline};
    use crate::scan::{IndexEntry, MetadataIndex};
    use crate::tree::Forest;

    fn leaf(title: &str, href: &str) -> NavNode {
        NavNode {
            title: title.to_string(),
            href: Some(href.to_string()),
            children: Vec::new(),
        }
    }

    fn sample_tree() -> NavTree {
        let mut index = MetadataIndex::default();
        for (id, title, parent) in [
            ("1", "Home", None),
            ("2", "Guides", Some("1")),
            ("3", "Install & run", Some("2")),
            ("4", "FAQ", Some("1")),
        ] {
            index.record(IndexEntry {
                id: id.to_string(),
                title: title.to_string(),
                parent_id: parent.map(ToString::to_string),
            });
        }
        NavTree::from_forest(&Forest::build_all(&index), "file:///srv/export/pages/")
    }

    #[test]
    fn outline_round_trip_preserves_structure() {
        let tree = sample_tree();
        let outline = tree.render_outline(false);
        assert_eq!(
            outline,
            "- [Home](file:///srv/export/pages/1.html)\n\
             \x20\x20- [Guides](file:///srv/export/pages/2.html)\n\
             \x20\x20\x20\x20- [Install & run](file:///srv/export/pages/3.html)\n\
             \x20\x20- [FAQ](file:///srv/export/pages/4.html)\n"
        );
        let parsed = parse_outline(&outline);
        assert_eq!(parsed.tree, tree);
        assert!(parsed.mode.is_none());
    }

    #[test]
    fn round_trip_survives_parentheses_in_folder_name() {
        let mut index = MetadataIndex::default();
        for (id, title, parent) in [("1", "Home (v2)", None), ("2", "Notes", Some("1"))] {
            index.record(IndexEntry {
                id: id.to_string(),
                title: title.to_string(),
                parent_id: parent.map(ToString::to_string),
            });
        }
        let prefix = "file:///srv/2024-05-06 1230 Release Notes (2024)/pages/";
        let tree = NavTree::from_forest(&Forest::build_all(&index), prefix);

        let parsed = parse_outline(&tree.render_outline(false));
        assert_eq!(parsed.tree, tree);
        assert_eq!(parsed.tree.roots[0].title, "Home (v2)");
        assert_eq!(parsed.tree.roots[0].page_id().as_deref(), Some("1"));
        let fragment = parsed
            .tree
            .render_fragment(FolderState::AllClosed, Some("2"))
            .into_string();
        assert!(fragment.contains(r#"<a href="1.html">Home (v2)</a>"#));
        assert!(fragment.contains(r#"<a href="2.html" class="active-page">Notes</a>"#));
    }

    #[test]
    fn parse_handles_tabs_directives_and_plain_items() {
        let parsed = parse_outline(
            "<!-- mode: space -->\n\
             # heading is ignored\n\
             - [Home](pages/1.html)\n\
             \t- Section\n\
             \t\t- [Deep%20Page](pages/7%2B8.html)\n\
             \n\
             - [Other](pages/9.html)\n",
        );
        assert!(parsed.wants_unwrap());
        let roots = &parsed.tree.roots;
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].children[0].title, "Section");
        assert!(roots[0].children[0].href.is_none());
        assert_eq!(roots[0].children[0].children[0].page_id().as_deref(), Some("7+8"));
        assert_eq!(roots[1].page_id().as_deref(), Some("9"));
    }

    #[test]
    fn dedent_attaches_to_matching_ancestor() {
        let parsed = parse_outline("- [A](A.html)\n  - [B](B.html)\n    - [C](C.html)\n  - [D](D.html)\n- [E](E.html)\n");
        let roots = &parsed.tree.roots;
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].children.len(), 2);
        assert_eq!(roots[0].children[1].title, "D");
        assert_eq!(roots[0].children[0].children[0].title, "C");
    }

    #[test]
    fn unwrap_promotes_children_of_single_root() {
        let mut tree = sample_tree();
        assert_eq!(tree.unwrap_single_root(), UnwrapOutcome::Unwrapped { promoted: 2 });
        assert_eq!(tree.roots[0].title, "Guides");
        assert_eq!(tree.roots[1].title, "FAQ");
    }

    #[test]
    fn unwrap_skips_multiple_roots() {
        let mut tree = NavTree {
            roots: vec![leaf("A", "A.html"), leaf("B", "B.html")],
        };
        let before = tree.clone();
        assert_eq!(tree.unwrap_single_root(), UnwrapOutcome::Skipped { top_level: 2 });
        assert_eq!(tree, before);
    }

    #[test]
    fn fragment_opens_roots_and_escapes_titles() {
        let html = sample_tree()
            .render_fragment(FolderState::RootsOpen, None)
            .into_string();
        assert!(html.starts_with(r#"<div class="sidebar-tree"><ul><li class="folder"><details open><summary><a href="1.html">Home</a>"#));
        assert!(html.contains(r#"<details><summary><a href="2.html">Guides</a></summary>"#));
        assert!(html.contains(r#"<li class="leaf"><a href="3.html">Install &amp; run</a></li>"#));
        assert!(!html.contains("active-page"));
    }

    #[test]
    fn fragment_highlights_active_path_only() {
        let html = sample_tree()
            .render_fragment(FolderState::AllClosed, Some("3"))
            .into_string();
        assert!(html.contains(r#"<details open><summary><a href="1.html">Home</a>"#));
        assert!(html.contains(r#"<details open><summary><a href="2.html">Guides</a>"#));
        assert!(html.contains(r#"<a href="3.html" class="active-page">Install &amp; run</a>"#));
        assert!(html.contains(r#"<li class="leaf"><a href="4.html">FAQ</a></li>"#));
    }

    #[test]
    fn nodes_without_href_render_as_text() {
        let tree = NavTree {
            roots: vec![NavNode {
                title: "Group".to_string(),
                href: None,
                children: vec![NavNode {
                    title: "Loose".to_string(),
                    href: None,
                    children: Vec::new(),
                }],
            }],
        };
        let html = tree.render_fragment(FolderState::AllClosed, None).into_string();
        assert!(html.contains("<summary>Group</summary>"));
        assert!(html.contains(r#"<li class="leaf"><span>Loose</span></li>"#));
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use maud::{DOCTYPE, Markup, PreEscaped, html};

use crate::layout::{SIDEBAR_EDIT_MD, SIDEBAR_MD, write_file};
use crate::nav::{NavNode, ParsedOutline, parse_outline};

pub const EDITOR_HTML: &str = "editor_sidebar.html";
pub const EDITOR_CSS: &str = include_str!("../assets/editor.css");
pub const EDITOR_JS: &str = include_str!("../assets/editor.js");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorReport {
    pub source: PathBuf,
    pub created_working_copy: bool,
    pub output: PathBuf,
    pub nodes: usize,
}

/// Write `editor_sidebar.html` for the outline working copy, seeding
/// `sidebar_edit.md` from `sidebar.md` on first use.
pub fn write_editor(site_dir: &Path) -> Result<EditorReport> {
    let source = site_dir.join(SIDEBAR_EDIT_MD);
    let mut created_working_copy = false;
    if !source.is_file() {
        let live = site_dir.join(SIDEBAR_MD);
        if !live.is_file() {
            bail!(
                "no {SIDEBAR_EDIT_MD} or {SIDEBAR_MD} found in {}",
                site_dir.display()
            );
        }
        fs::copy(&live, &source).with_context(|| {
            format!("failed to copy {} to {}", live.display(), source.display())
        })?;
        created_working_copy = true;
        tracing::info!("created working copy {}", source.display());
    }

    let text = fs::read_to_string(&source)
        .with_context(|| format!("failed to read {}", source.display()))?;
    let parsed = parse_outline(&text);
    let output = site_dir.join(EDITOR_HTML);
    write_file(&output, &render_editor(&parsed))?;

    Ok(EditorReport {
        source,
        created_working_copy,
        output,
        nodes: parsed.tree.len(),
    })
}

pub fn render_editor(parsed: &ParsedOutline) -> String {
    let nodes = parsed.tree.len();
    let page = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { "Sidebar Editor" }
                style { (PreEscaped(EDITOR_CSS)) }
            }
            body {
                div.toolbar {
                    button type="button" data-action="expand-all" { "Expand All" }
                    button type="button" data-action="collapse-all" { "Collapse All" }
                    span.level-buttons {
                        @for level in 1..=5 {
                            button type="button" data-action="level" data-level=(level) { "Lvl " (level) }
                        }
                    }
                    input id="filter" type="search" placeholder="Filter titles";
                    button type="button" data-action="new-root" { "+ New Root" }
                    button.primary type="button" data-action="copy-markdown" { "Copy Markdown" }
                }
                p.hint {
                    "Editing " (SIDEBAR_EDIT_MD) ": " (nodes) " entries. "
                    "Paste the copied markdown into " (SIDEBAR_EDIT_MD)
                    " and run the sidebar patch command to apply it."
                }
                ul id="root-tree" data-mode=[parsed.mode.as_deref()] {
                    @for node in &parsed.tree.roots {
                        (render_node(node))
                    }
                }
                div id="modal-overlay" class="hidden" {
                    div.modal {
                        h2 { "Outline markdown" }
                        textarea id="md-output" readonly spellcheck="false" {}
                        div.modal-actions {
                            button type="button" data-action="select-markdown" { "Select All" }
                            button type="button" data-action="close-modal" { "Close" }
                        }
                    }
                }
                div id="toast" class="hidden" {}
                script { (PreEscaped(format!("window.EDITOR_NODE_COUNT = {nodes};"))) }
                script { (PreEscaped(EDITOR_JS)) }
            }
        }
    };
    page.into_string()
}

/// Editor rows link into the export's `pages/` folder.
fn editor_href(node: &NavNode) -> Option<String> {
    node.file_name().map(|name| format!("pages/{name}"))
}

fn render_node(node: &NavNode) -> Markup {
    let has_children = !node.children.is_empty();
    html! {
        li.node {
            div.node-row draggable="true" {
                span.toggle-icon.leaf[!has_children] { "▸" }
                span.drag-handle title="Drag to move" { "⠿" }
                span.node-icon { @if has_children { "📁" } @else { "📄" } }
                span.node-title contenteditable="true" spellcheck="false" data-href=[editor_href(node)] {
                    (node.title)
                }
                span.actions {
                    button.btn-link type="button" title="Open page" { "↗" }
                    button.btn-add type="button" title="Add child" { "+" }
                    button.btn-exp type="button" title="Expand branch" { "⊞" }
                    button.btn-col type="button" title="Collapse branch" { "⊟" }
                    button.btn-del type="button" title="Delete or restore" { "✕" }
                }
            }
            ul.hidden {
                @for child in &node.children {
                    (render_node(child))
                }
            }
        }
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

use crate::html::{find_element, for_each_tag};
use crate::layout::{ExportLayout, SIDEBAR_EDIT_MD, SIDEBAR_MD, SIDEBAR_ORIG_MD, write_file};
use crate::nav::{FolderState, NavTree, SIDEBAR_END, SIDEBAR_START, UnwrapOutcome, parse_outline};
use crate::transform::PAGE_ID_META;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchOptions {
    pub restore_original: bool,
    pub unwrap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched,
    /// Page has no `<aside id="sidebar">`; left untouched.
    NoContainer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub source: PathBuf,
    pub unwrap: Option<UnwrapOutcome>,
    pub nav_nodes: usize,
    pub patched: usize,
    pub untouched: usize,
    pub failed: Vec<PathBuf>,
}

/// Outline used for patching: the edit copy when present, then the live
/// outline; `restore_original` always uses the pristine copy.
pub fn select_outline(site_dir: &Path, restore_original: bool) -> Result<PathBuf> {
    let candidates: &[&str] = if restore_original {
        &[SIDEBAR_ORIG_MD]
    } else {
        &[SIDEBAR_EDIT_MD, SIDEBAR_MD]
    };
    for name in candidates {
        let path = site_dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }
    bail!(
        "no sidebar outline found in {} (looked for {})",
        site_dir.display(),
        candidates.join(", ")
    )
}

/// Rebuild the navigation of every exported page from the outline text.
pub fn patch_site(site_dir: &Path, options: PatchOptions) -> Result<PatchReport> {
    let layout = ExportLayout::new(site_dir);
    if !layout.pages.is_dir() {
        bail!("{} has no pages/ directory", site_dir.display());
    }
    let source = select_outline(site_dir, options.restore_original)?;
    let text = fs::read_to_string(&source)
        .with_context(|| format!("failed to read {}", source.display()))?;
    let parsed = parse_outline(&text);
    let wants_unwrap = options.unwrap || parsed.wants_unwrap();
    let mut tree = parsed.tree;

    let unwrap = if wants_unwrap {
        let outcome = tree.unwrap_single_root();
        if let UnwrapOutcome::Skipped { top_level } = outcome {
            tracing::warn!(
                "unwrap skipped: outline has {top_level} top-level entries, expected exactly one"
            );
        }
        Some(outcome)
    } else {
        None
    };

    let mut report = PatchReport {
        source,
        unwrap,
        nav_nodes: tree.len(),
        patched: 0,
        untouched: 0,
        failed: Vec::new(),
    };

    for entry in WalkDir::new(&layout.pages).max_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", layout.pages.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some("html")
        {
            continue;
        }
        match patch_file(path, &tree) {
            Ok(PatchOutcome::Patched) => report.patched += 1,
            Ok(PatchOutcome::NoContainer) => report.untouched += 1,
            Err(error) => {
                tracing::warn!("could not patch {}: {error:#}", path.display());
                report.failed.push(path.to_path_buf());
            }
        }
    }
    Ok(report)
}

pub fn patch_file(path: &Path, tree: &NavTree) -> Result<PatchOutcome> {
    let html =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let page_id = page_id_of(&html, path);
    match patch_html(&html, tree, &page_id) {
        Some(patched) => {
            if patched != html {
                write_file(path, &patched)?;
            }
            Ok(PatchOutcome::Patched)
        }
        None => Ok(PatchOutcome::NoContainer),
    }
}

/// Replace the navigation container contents; `None` when there is none.
pub fn patch_html(html: &str, tree: &NavTree, page_id: &str) -> Option<String> {
    let aside = find_element(html, "aside", |tag| tag.get("id") == Some("sidebar"))?;
    let fragment = tree
        .render_fragment(FolderState::AllClosed, Some(page_id))
        .into_string();
    let mut output = String::with_capacity(html.len() + fragment.len());
    output.push_str(&html[..aside.open_end]);
    output.push_str(SIDEBAR_START);
    output.push_str(&fragment);
    output.push_str(SIDEBAR_END);
    output.push_str(&html[aside.close_start..]);
    Some(output)
}

/// Page id from the page-id meta marker, else the file stem.
pub fn page_id_of(html: &str, path: &Path) -> String {
    let mut from_meta = None;
    for_each_tag(html, "meta", |tag| {
        if from_meta.is_none()
            && tag.get("name") == Some(PAGE_ID_META)
            && let Some(content) = tag.get("content").map(str::trim)
            && !content.is_empty()
        {
            from_meta = Some(content.to_string());
        }
    });
    from_meta.unwrap_or_else(|| {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string()
    })
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;

use crate::alternate::RstConverter;
use crate::index_page::render_index;
use crate::layout::{
    ExportLayout, INDEX_HTML, REPORT_JSON, SIDEBAR_HTML, SIDEBAR_MD, SIDEBAR_ORIG_MD, write_file,
};
use crate::model::Node;
use crate::nav::{FolderState, NavTree};
use crate::remote::{CorpusApi, FetchOutcome};
use crate::scan::{Inventory, ScanRules, ScanSession, Strategy};
use crate::transform::{MediaSink, TransformContext, render_failure_page, transform_page};
use crate::tree::Forest;

const INDEX_HEADING: &str = "Export Index";

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub base_url: String,
    pub threads: usize,
    /// Extra stylesheet hrefs relative to `pages/`.
    pub stylesheets: Vec<String>,
    pub rst: Option<RstConverter>,
    /// Skip failed pages instead of writing a placeholder.
    pub skip_failed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportReport {
    pub strategy: String,
    pub output_dir: String,
    pub workers: usize,
    pub scanned: usize,
    pub exported: usize,
    pub placeholders: usize,
    pub skipped: usize,
    pub failures: Vec<FailedPage>,
    pub attachments_saved: usize,
    pub attachments_failed: usize,
    pub rst_written: usize,
    pub requests: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedPage {
    pub id: String,
    pub reason: String,
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PageStatus {
    Exported {
        attachments_saved: usize,
        attachments_failed: usize,
        rst_written: bool,
        /// The page is written but its metadata sidecar is not.
        sidecar_error: Option<String>,
    },
    Placeholder {
        reason: String,
    },
    Skipped {
        reason: String,
    },
}

/// Scan, derive navigation, then fetch and transform every page.
pub fn run_export<A: CorpusApi + ?Sized>(
    api: &A,
    layout: &ExportLayout,
    strategy: &Strategy,
    rules: &ScanRules,
    options: &ExportOptions,
) -> Result<ExportReport> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(options.threads.max(1))
        .build()
        .context("failed to build export worker pool")?;

    let mut session = ScanSession::new();
    let inventory = session.scan(api, strategy, rules);
    let forest = Forest::build(&session.index, &inventory.targets);
    let nav = NavTree::from_forest(&forest, &layout.pages_href_prefix());
    write_sidebars(layout, &nav, strategy.is_collection())?;

    let statuses = pool.install(|| export_pages(api, layout, &inventory, &session, &nav, options));
    write_file(
        &layout.file(INDEX_HTML),
        &render_index(&session.index, &index_stylesheets(options), INDEX_HEADING),
    )?;

    let mut report = ExportReport {
        strategy: strategy.describe(),
        output_dir: layout.root.display().to_string(),
        workers: options.threads.max(1),
        scanned: inventory.ordered.len(),
        exported: 0,
        placeholders: 0,
        skipped: 0,
        failures: Vec::new(),
        attachments_saved: 0,
        attachments_failed: 0,
        rst_written: 0,
        requests: 0,
    };
    for (id, status) in statuses {
        match status {
            PageStatus::Exported {
                attachments_saved,
                attachments_failed,
                rst_written,
                sidecar_error,
            } => {
                report.exported += 1;
                report.attachments_saved += attachments_saved;
                report.attachments_failed += attachments_failed;
                report.rst_written += usize::from(rst_written);
                if let Some(reason) = sidecar_error {
                    report.failures.push(FailedPage {
                        id,
                        reason,
                        placeholder: false,
                    });
                }
            }
            PageStatus::Placeholder { reason } => {
                report.placeholders += 1;
                report.failures.push(FailedPage {
                    id,
                    reason,
                    placeholder: true,
                });
            }
            PageStatus::Skipped { reason } => {
                report.skipped += 1;
                report.failures.push(FailedPage {
                    id,
                    reason,
                    placeholder: false,
                });
            }
        }
    }
    report.requests = api.request_count();
    write_report(layout, &report)?;
    Ok(report)
}

fn index_stylesheets(options: &ExportOptions) -> Vec<String> {
    let mut stylesheets = options.stylesheets.clone();
    stylesheets.push(crate::transform::BASE_STYLESHEET.to_string());
    stylesheets
}

/// `sidebar.html`, `sidebar.md` and the pristine `sidebar_orig.md`.
pub fn write_sidebars(layout: &ExportLayout, nav: &NavTree, space_mode: bool) -> Result<()> {
    let fragment = nav.render_fragment(FolderState::RootsOpen, None).into_string();
    write_file(&layout.file(SIDEBAR_HTML), &fragment)?;
    let outline = nav.render_outline(space_mode);
    write_file(&layout.file(SIDEBAR_MD), &outline)?;
    write_file(&layout.file(SIDEBAR_ORIG_MD), &outline)?;
    Ok(())
}

fn write_report(layout: &ExportLayout, report: &ExportReport) -> Result<()> {
    let path = layout.logs.join(REPORT_JSON);
    let content = serde_json::to_string_pretty(report).context("failed to serialize export report")?;
    write_file(&path, &content)
}

fn export_pages<A: CorpusApi + ?Sized>(
    api: &A,
    layout: &ExportLayout,
    inventory: &Inventory,
    session: &ScanSession,
    nav: &NavTree,
    options: &ExportOptions,
) -> Vec<(String, PageStatus)> {
    let media = AttachmentStore::new(api, &layout.attachments);
    let context = TransformContext {
        base_url: &options.base_url,
        targets: &inventory.targets,
        stylesheets: &options.stylesheets,
        nav: Some(nav),
        media: &media,
    };
    let total = inventory.ordered.len();
    let completed = AtomicUsize::new(0);
    println!("pages.total: {total}");

    inventory
        .ordered
        .par_iter()
        .map(|id| {
            let status = match export_page(api, layout, id, &context, options, &media) {
                Ok(status) => status,
                Err(error) => {
                    tracing::warn!("page {id} failed: {error:#}");
                    PageStatus::Skipped {
                        reason: format!("{error:#}"),
                    }
                }
            };
            let status = match status {
                PageStatus::Skipped { reason } if !options.skip_failed => {
                    let title = session
                        .index
                        .get(id)
                        .map(|entry| entry.title.clone())
                        .unwrap_or_else(|| format!("Page {id}"));
                    write_placeholder(layout, id, &title, &reason, &context)
                }
                other => other,
            };
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            println!("pages.done: {done}/{total} ({id})");
            (id.clone(), status)
        })
        .collect()
}

fn export_page<A: CorpusApi + ?Sized>(
    api: &A,
    layout: &ExportLayout,
    id: &str,
    context: &TransformContext<'_>,
    options: &ExportOptions,
    media: &AttachmentStore<'_, A>,
) -> Result<PageStatus> {
    let node = match api.fetch_node(id) {
        FetchOutcome::Found(node) => node,
        failure => {
            tracing::warn!("could not fetch page {id}: {}", failure.describe());
            return Ok(PageStatus::Skipped {
                reason: failure.describe(),
            });
        }
    };

    let processed = transform_page(&node, context);
    write_file(&layout.page_html(id), &processed)?;

    let (attachments_saved, attachments_failed) = save_attachments(api, id, options, media);
    let sidecar_error = write_sidecar(layout, &node, &processed).err().map(|error| {
        tracing::warn!("page {id} written without metadata sidecar: {error:#}");
        format!("{error:#}")
    });

    let rst_written = match &options.rst {
        Some(converter) => match converter.convert(&processed, &layout.page_rst(id)) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!("rst conversion of page {id} failed: {error:#}");
                false
            }
        },
        None => false,
    };

    Ok(PageStatus::Exported {
        attachments_saved,
        attachments_failed,
        rst_written,
        sidecar_error,
    })
}

fn write_placeholder(
    layout: &ExportLayout,
    id: &str,
    title: &str,
    reason: &str,
    context: &TransformContext<'_>,
) -> PageStatus {
    let page = render_failure_page(id, title, reason, context);
    if let Err(error) = write_file(&layout.page_html(id), &page) {
        tracing::warn!("could not write placeholder for page {id}: {error:#}");
        return PageStatus::Skipped {
            reason: reason.to_string(),
        };
    }
    PageStatus::Placeholder {
        reason: reason.to_string(),
    }
}

fn save_attachments<A: CorpusApi + ?Sized>(
    api: &A,
    id: &str,
    options: &ExportOptions,
    media: &AttachmentStore<'_, A>,
) -> (usize, usize) {
    let attachments = match api.fetch_attachments(id) {
        FetchOutcome::Found(attachments) => attachments,
        FetchOutcome::Empty => return (0, 0),
        failure => {
            tracing::warn!("could not list attachments of page {id}: {}", failure.describe());
            return (0, 0);
        }
    };

    let mut saved = 0usize;
    let mut failed = 0usize;
    for attachment in attachments {
        let name = attachment.title.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            tracing::warn!("skipping attachment with unusable name '{}' on page {id}", attachment.title);
            failed += 1;
            continue;
        }
        let url = attachment_url(&options.base_url, &attachment.download_path);
        if media.store(&url, name) {
            saved += 1;
        } else {
            failed += 1;
        }
    }
    (saved, failed)
}

fn attachment_url(base_url: &str, download_path: &str) -> String {
    if download_path.starts_with("http://") || download_path.starts_with("https://") {
        return download_path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    match download_path.strip_prefix('/') {
        Some(path) => format!("{base}/{path}"),
        None => format!("{base}/{download_path}"),
    }
}

/// Remote record plus `body_processed` and `view_url`.
fn write_sidecar(layout: &ExportLayout, node: &Node, processed: &str) -> Result<()> {
    let mut record = match &node.raw {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    record
        .entry("id")
        .or_insert_with(|| Value::String(node.id.clone()));
    record
        .entry("title")
        .or_insert_with(|| Value::String(node.title.clone()));
    record.insert(
        "body_processed".to_string(),
        Value::String(processed.to_string()),
    );
    record.insert(
        "view_url".to_string(),
        node.view_url.clone().map(Value::String).unwrap_or(Value::Null),
    );
    let content = serde_json::to_string_pretty(&Value::Object(record))
        .with_context(|| format!("failed to serialize metadata of page {}", node.id))?;
    write_file(&layout.page_json(&node.id), &content)
}

/// Per-run download cache shared by workers. Each URL is fetched at most
/// once; a later request for the same URL under another name copies the
/// stored file. The flat attachments directory is last-writer-wins on name
/// clashes.
struct AttachmentStore<'a, A: ?Sized> {
    api: &'a A,
    dir: &'a Path,
    downloads: Mutex<HashMap<String, Arc<OnceLock<Option<PathBuf>>>>>,
}

impl<'a, A: CorpusApi + ?Sized> AttachmentStore<'a, A> {
    fn new(api: &'a A, dir: &'a Path) -> Self {
        Self {
            api,
            dir,
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// Shared completion slot for `url`; concurrent callers wait on the first.
    fn slot(&self, url: &str) -> Arc<OnceLock<Option<PathBuf>>> {
        match self.downloads.lock() {
            Ok(mut downloads) => Arc::clone(downloads.entry(url.to_string()).or_default()),
            Err(_) => Arc::new(OnceLock::new()),
        }
    }

    fn fetch_to(&self, url: &str, file_name: &str) -> Result<PathBuf> {
        let bytes = self.api.download(url)?;
        let target = self.dir.join(file_name);
        fs::write(&target, bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;
        Ok(target)
    }
}

impl<A: CorpusApi + ?Sized> MediaSink for AttachmentStore<'_, A> {
    fn store(&self, url: &str, file_name: &str) -> bool {
        let slot = self.slot(url);
        let stored = slot.get_or_init(|| match self.fetch_to(url, file_name) {
            Ok(path) => Some(path),
            Err(error) => {
                tracing::warn!("download of {url} failed: {error:#}");
                None
            }
        });
        let Some(stored) = stored else {
            return false;
        };
        let target = self.dir.join(file_name);
        if *stored == target {
            return true;
        }
        match fs::copy(stored, &target) {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(
                    "could not copy {} to {}: {error}",
                    stored.display(),
                    target.display()
                );
                false
            }
        }
    }
}

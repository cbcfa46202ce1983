use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::remote::{CorpusApi, FetchOutcome};
use crate::scan::Strategy;

pub const SITE_CSS: &str = include_str!("../assets/site.css");
pub const SIDEBAR_JS: &str = include_str!("../assets/sidebar.js");

pub const SIDEBAR_HTML: &str = "sidebar.html";
pub const SIDEBAR_MD: &str = "sidebar.md";
pub const SIDEBAR_ORIG_MD: &str = "sidebar_orig.md";
pub const SIDEBAR_EDIT_MD: &str = "sidebar_edit.md";
pub const INDEX_HTML: &str = "index.html";
pub const REPORT_JSON: &str = "export-report.json";

/// Directory tree of one export run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportLayout {
    pub root: PathBuf,
    pub pages: PathBuf,
    pub attachments: PathBuf,
    pub styles: PathBuf,
    pub logs: PathBuf,
}

impl ExportLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            pages: root.join("pages"),
            attachments: root.join("attachments"),
            styles: root.join("styles"),
            logs: root.join("logs"),
            root,
        }
    }

    /// Create the run directories. Existing directories are reused.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = Self::new(root);
        for dir in [&layout.pages, &layout.attachments, &layout.styles, &layout.logs] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(layout)
    }

    pub fn page_html(&self, id: &str) -> PathBuf {
        self.pages.join(format!("{id}.html"))
    }

    pub fn page_json(&self, id: &str) -> PathBuf {
        self.pages.join(format!("{id}.json"))
    }

    pub fn page_rst(&self, id: &str) -> PathBuf {
        self.pages.join(format!("{id}.rst"))
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// `file://` URI of `pages/`, with trailing slash, used as outline href
    /// prefix. Parentheses are percent-encoded so the outline link syntax
    /// stays unambiguous.
    pub fn pages_href_prefix(&self) -> String {
        let absolute = fs::canonicalize(&self.pages).unwrap_or_else(|_| self.pages.clone());
        let uri = match reqwest::Url::from_directory_path(&absolute) {
            Ok(url) => url.to_string(),
            Err(()) => format!("file://{}/", absolute.display()),
        };
        uri.replace('(', "%28").replace(')', "%29")
    }

    /// Write the bundled stylesheet and script, copy an optional user
    /// stylesheet, and return the extra stylesheet hrefs for pages.
    pub fn install_styles(&self, css_file: Option<&Path>) -> Result<Vec<String>> {
        write_file(&self.styles.join("site.css"), SITE_CSS)?;
        write_file(&self.styles.join("sidebar.js"), SIDEBAR_JS)?;

        let mut stylesheets = Vec::new();
        if let Some(css_file) = css_file {
            if !css_file.is_file() {
                tracing::warn!("css file {} not found; continuing without it", css_file.display());
                return Ok(stylesheets);
            }
            let Some(name) = css_file.file_name().and_then(|name| name.to_str()) else {
                tracing::warn!("css file {} has no usable name", css_file.display());
                return Ok(stylesheets);
            };
            if name == "site.css" || name == "sidebar.js" {
                tracing::warn!("css file {name} collides with a bundled asset; skipped");
                return Ok(stylesheets);
            }
            let target = self.styles.join(name);
            fs::copy(css_file, &target).with_context(|| {
                format!("failed to copy {} to {}", css_file.display(), target.display())
            })?;
            stylesheets.push(format!("../styles/{name}"));
        }
        Ok(stylesheets)
    }
}

pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

/// `<YYYY-MM-DD HHMM> <sanitized title>`
pub fn run_folder_name(started: DateTime<Local>, title: &str) -> String {
    let title = sanitize_filename(title);
    let stamp = started.format("%Y-%m-%d %H%M");
    if title.is_empty() {
        format!("{stamp} Export")
    } else {
        format!("{stamp} {title}")
    }
}

/// Human title of a run, used for the output folder name.
pub fn run_title<A: CorpusApi + ?Sized>(api: &A, strategy: &Strategy) -> String {
    match strategy {
        Strategy::Collection { key } => format!("Space {key}"),
        Strategy::LabelForest { label } => format!("Export {label}"),
        Strategy::Single { id } | Strategy::Tree { root_id: id } => match api.fetch_node(id) {
            FetchOutcome::Found(node) if !node.title.trim().is_empty() => node.title,
            FetchOutcome::Found(_) | FetchOutcome::Empty => format!("Page {id}"),
            failure => {
                tracing::warn!("could not fetch title of page {id}: {}", failure.describe());
                format!("Page {id}")
            }
        },
    }
}

/// Replace characters that are invalid in file names on common platforms and
/// trim surrounding whitespace and dots.
pub fn sanitize_filename(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '/' | '\\') {
            output.push('_');
            continue;
        }
        output.push(ch);
    }
    output
        .trim_matches(|ch: char| ch.is_whitespace() || ch == '.')
        .to_string()
}

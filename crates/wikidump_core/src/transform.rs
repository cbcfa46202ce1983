use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::DateTime;
use maud::{DOCTYPE, Markup, PreEscaped, html};
use regex::Regex;

use crate::html::{Tag, find_element, percent_decode, rewrite_tags};
use crate::model::{Node, NodeVersion};
use crate::nav::{FolderState, NavTree, SIDEBAR_END, SIDEBAR_START};

pub const PAGE_ID_META: &str = "wikidump-page-id";
pub const LABELS_META: &str = "wikidump-labels";
pub const BASE_STYLESHEET: &str = "../styles/site.css";
pub const SIDEBAR_SCRIPT: &str = "../styles/sidebar.js";

const MEDIA_MARKERS: [&str; 2] = ["/download/", "/images/icons/"];

/// Stores remote media under `attachments/`. Called from worker threads.
pub trait MediaSink: Sync {
    /// Make `url` available as `attachments/<file_name>`; `false` on failure.
    fn store(&self, url: &str, file_name: &str) -> bool;
}

pub struct TransformContext<'a> {
    pub base_url: &'a str,
    pub targets: &'a BTreeSet<String>,
    /// Extra stylesheets, linked before [`BASE_STYLESHEET`].
    pub stylesheets: &'a [String],
    pub nav: Option<&'a NavTree>,
    pub media: &'a dyn MediaSink,
}

/// Turn a raw body into a standalone page.
pub fn transform_page(node: &Node, context: &TransformContext<'_>) -> String {
    let (head_extra, body) = split_shell(&node.body);
    let body = localize_media(&body, context);
    let body = rewrite_links(&body, context);
    let header = html! {
        h1 { (node.title) }
        @if let Some(line) = node.version.as_ref().map(version_line) {
            p.page-meta { (line) }
        }
    };
    render_document(
        &node.id,
        &node.title,
        &node.labels,
        &head_extra,
        html! { (header) (PreEscaped(body)) },
        context,
    )
}

/// Page written in place of a node that could not be fetched, so sidebar
/// links keep resolving.
pub fn render_failure_page(
    id: &str,
    title: &str,
    reason: &str,
    context: &TransformContext<'_>,
) -> String {
    let content = html! {
        h1 { (title) }
        div.export-failure {
            p { "This page could not be exported." }
            p { code { (reason) } }
        }
    };
    render_document(id, title, &[], "", content, context)
}

fn render_document(
    id: &str,
    title: &str,
    labels: &[String],
    head_extra: &str,
    content: Markup,
    context: &TransformContext<'_>,
) -> String {
    let page = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (title) }
                meta name=(PAGE_ID_META) content=(id);
                meta name=(LABELS_META) content=(labels.join(", "));
                @for stylesheet in context.stylesheets {
                    link rel="stylesheet" href=(stylesheet) type="text/css";
                }
                link rel="stylesheet" href=(BASE_STYLESHEET) type="text/css";
                (PreEscaped(head_extra))
            }
            body {
                @if let Some(nav) = context.nav {
                    (two_pane(nav, id, content))
                } @else {
                    main id="content" { (content) }
                }
            }
        }
    };
    page.into_string()
}

fn two_pane(nav: &NavTree, id: &str, content: Markup) -> Markup {
    html! {
        div.page-layout {
            aside id="sidebar" {
                (PreEscaped(SIDEBAR_START))
                (nav.render_fragment(FolderState::RootsOpen, Some(id)))
                (PreEscaped(SIDEBAR_END))
            }
            div id="sidebar-resizer" class="sidebar-resizer" {}
            main id="content" class="content-pane" {
                button id="sidebar-toggle" type="button" title="Toggle sidebar" { "\u{2630}" }
                (content)
            }
        }
        script src=(SIDEBAR_SCRIPT) {}
    }
}

/// Existing `<head>` contents and `<body>` contents; a bare fragment is all body.
fn split_shell(raw: &str) -> (String, String) {
    let head = find_element(raw, "head", |_| true);
    let head_inner = head
        .map(|span| span.inner(raw).trim().to_string())
        .unwrap_or_default();
    if let Some(body) = find_element(raw, "body", |_| true) {
        return (head_inner, body.inner(raw).to_string());
    }
    match head {
        Some(span) => {
            let mut body = raw[..span.open_start].to_string();
            body.push_str(&raw[span.close_end..]);
            (head_inner, body)
        }
        None => (head_inner, raw.to_string()),
    }
}

/// `Last changed by NAME on YYYY-MM-DD HH:MM`.
pub fn version_line(version: &NodeVersion) -> String {
    let author = version
        .by
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("Unknown");
    match version.when.as_deref() {
        Some(when) => format!("Last changed by {author} on {}", format_timestamp(when)),
        None => format!("Last changed by {author}"),
    }
}

fn format_timestamp(raw: &str) -> String {
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(parsed) => parsed.format("%Y-%m-%d %H:%M").to_string(),
        Err(_) => raw.to_string(),
    }
}

fn localize_media(body: &str, context: &TransformContext<'_>) -> String {
    rewrite_tags(body, &["img"], |tag| {
        let Some(src) = tag.get("src").map(str::to_string) else {
            return false;
        };
        if !MEDIA_MARKERS.iter().any(|marker| src.contains(marker)) {
            return false;
        }
        let Some(file_name) = media_file_name(&src) else {
            tracing::warn!("could not derive a file name for image {src}");
            return false;
        };
        let url = absolutize(&src, context.base_url);
        if context.media.store(&url, &file_name) {
            tag.set("src", &format!("../attachments/{file_name}"));
            true
        } else {
            tracing::warn!("could not download image {src}");
            false
        }
    })
}

/// Percent-decoded last path segment of a media reference.
pub fn media_file_name(src: &str) -> Option<String> {
    let path = src.split(['?', '#']).next().unwrap_or_default();
    let encoded = path.rsplit('/').next().unwrap_or_default();
    let decoded = percent_decode(encoded);
    let name = decoded.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    (!name.is_empty() && name != "." && name != "..").then(|| name.to_string())
}

fn rewrite_links(body: &str, context: &TransformContext<'_>) -> String {
    rewrite_tags(body, &["a"], |tag| {
        let Some(href) = tag.get("href").map(str::to_string) else {
            return false;
        };
        if href.is_empty() {
            return false;
        }
        if let Some(id) = classify_link(tag)
            && context.targets.contains(&id)
        {
            tag.set("href", &format!("{id}.html"));
            return true;
        }
        if is_root_relative(&href) {
            tag.set("href", &absolutize(&href, context.base_url));
            return true;
        }
        false
    })
}

type LinkMatcher = fn(&Tag) -> Option<String>;

/// Ranked: the first matcher that yields an id wins.
const LINK_MATCHERS: [LinkMatcher; 3] = [linked_resource_id, pages_path_segment, page_id_query];

pub fn classify_link(tag: &Tag) -> Option<String> {
    LINK_MATCHERS.iter().find_map(|matcher| matcher(tag))
}

fn linked_resource_id(tag: &Tag) -> Option<String> {
    let id = tag.get("data-linked-resource-id")?.trim();
    let kind = tag.get("data-linked-resource-type").map(str::trim);
    (!id.is_empty() && matches!(kind, None | Some("") | Some("page"))).then(|| id.to_string())
}

fn pages_path_segment(tag: &Tag) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"/pages/(\d+)").expect("pages pattern compiles"));
    capture_id(pattern, tag.get("href")?)
}

fn page_id_query(tag: &Tag) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"pageId=(\d+)").expect("pageId pattern compiles"));
    capture_id(pattern, tag.get("href")?)
}

fn capture_id(pattern: &Regex, href: &str) -> Option<String> {
    pattern
        .captures(href)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}

fn is_root_relative(href: &str) -> bool {
    href.starts_with('/') && !href.starts_with("//")
}

fn absolutize(reference: &str, base_url: &str) -> String {
    if is_root_relative(reference) {
        format!("{}{}", base_url.trim_end_matches('/'), reference)
    } else {
        reference.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::{
        MediaSink, TransformContext, classify_link, media_file_name, render_failure_page,
        transform_page, version_line,
    };
    use crate::html::Tag;
    use crate::model::{Node, NodeVersion};
    use crate::nav::{NavNode, NavTree, SIDEBAR_END, SIDEBAR_START};

    #[derive(Default)]
    struct RecordingMedia {
        stored: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl MediaSink for RecordingMedia {
        fn store(&self, url: &str, file_name: &str) -> bool {
            if let Ok(mut stored) = self.stored.lock() {
                stored.push((url.to_string(), file_name.to_string()));
            }
            !self.fail
        }
    }

    fn node(body: &str) -> Node {
        Node {
            id: "100".to_string(),
            title: "Release <notes>".to_string(),
            parent_id: None,
            labels: vec!["ops".to_string(), "draft".to_string()],
            body: body.to_string(),
            version: Some(NodeVersion {
                by: Some("Grace Hopper".to_string()),
                when: Some("2024-05-06T07:08:09.000+02:00".to_string()),
            }),
            collection_key: None,
            view_url: None,
            raw: serde_json::Value::Null,
        }
    }

    fn targets(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    fn context<'a>(
        targets: &'a BTreeSet<String>,
        nav: Option<&'a NavTree>,
        media: &'a RecordingMedia,
    ) -> TransformContext<'a> {
        TransformContext {
            base_url: "https://wiki.example.org/",
            targets,
            stylesheets: &[],
            nav,
            media,
        }
    }

    fn anchor(raw: &str) -> Tag {
        Tag::parse(raw).expect("tag")
    }

    #[test]
    fn link_matchers_are_ranked() {
        assert_eq!(
            classify_link(&anchor(
                r#"<a href="/pages/5?pageId=6" data-linked-resource-id="4" data-linked-resource-type="page">"#
            )),
            Some("4".to_string())
        );
        assert_eq!(
            classify_link(&anchor(
                r#"<a href="/spaces/X/pages/5" data-linked-resource-id="4" data-linked-resource-type="attachment">"#
            )),
            Some("5".to_string())
        );
        assert_eq!(
            classify_link(&anchor(r#"<a href="/viewpage.action?pageId=6">"#)),
            Some("6".to_string())
        );
        assert_eq!(classify_link(&anchor(r#"<a href="https://rust-lang.org">"#)), None);
    }

    #[test]
    fn links_resolve_locally_only_inside_target_set() {
        let targets = targets(&["42"]);
        let media = RecordingMedia::default();
        let body = concat!(
            r#"<a href="/pages/42">in</a>"#,
            r#"<a href="/pages/43">out</a>"#,
            r#"<a href="https://other.example.com/pages/42">abs</a>"#,
            r#"<a href="//cdn.example.com/x">proto</a>"#,
            r#"<a name="anchor">bare</a>"#,
        );
        let page = transform_page(&node(body), &context(&targets, None, &media));
        assert!(page.contains(r#"<a href="42.html">in</a>"#));
        assert!(page.contains(r#"<a href="https://wiki.example.org/pages/43">out</a>"#));
        // Absolute links inside the set still classify and go local.
        assert!(page.contains(r#"<a href="42.html">abs</a>"#));
        assert!(page.contains(r#"<a href="//cdn.example.com/x">proto</a>"#));
        assert!(page.contains(r#"<a name="anchor">bare</a>"#));
    }

    #[test]
    fn media_is_localized_and_other_images_untouched() {
        let targets = targets(&[]);
        let media = RecordingMedia::default();
        let body = concat!(
            r#"<img src="/download/attachments/100/my%20chart.png?version=2&amp;api=v2">"#,
            r#"<img src="https://cdn.example.com/logo.png">"#,
        );
        let page = transform_page(&node(body), &context(&targets, None, &media));
        assert!(page.contains(r#"<img src="../attachments/my chart.png">"#));
        assert!(page.contains(r#"<img src="https://cdn.example.com/logo.png">"#));
        let stored = media.stored.lock().expect("lock").clone();
        assert_eq!(
            stored,
            vec![(
                "https://wiki.example.org/download/attachments/100/my%20chart.png?version=2&api=v2"
                    .to_string(),
                "my chart.png".to_string()
            )]
        );
    }

    #[test]
    fn failed_media_keeps_original_reference() {
        let targets = targets(&[]);
        let media = RecordingMedia {
            fail: true,
            ..RecordingMedia::default()
        };
        let body = r#"<img class="x" src="/images/icons/emoticons/smile.svg">"#;
        let page = transform_page(&node(body), &context(&targets, None, &media));
        assert!(page.contains(body));
    }

    #[test]
    fn head_markers_heading_and_version_line_are_injected() {
        let targets = targets(&[]);
        let media = RecordingMedia::default();
        let page = transform_page(
            &node("<html><head><style>p{}</style></head><body><p>Hi</p></body></html>"),
            &context(&targets, None, &media),
        );
        assert!(page.contains("<title>Release &lt;notes&gt;</title>"));
        assert!(page.contains(r#"<meta name="wikidump-page-id" content="100">"#));
        assert!(page.contains(r#"<meta name="wikidump-labels" content="ops, draft">"#));
        assert!(page.contains(r#"<link rel="stylesheet" href="../styles/site.css" type="text/css">"#));
        assert!(page.contains("<style>p{}</style>"));
        assert!(page.contains("<h1>Release &lt;notes&gt;</h1>"));
        assert!(page.contains("Last changed by Grace Hopper on 2024-05-06 07:08"));
        assert!(page.contains("<p>Hi</p>"));
        assert!(!page.contains("sidebar"));
    }

    #[test]
    fn version_line_falls_back_to_raw_date_and_unknown_author() {
        let version = NodeVersion {
            by: None,
            when: Some("last tuesday".to_string()),
        };
        assert_eq!(version_line(&version), "Last changed by Unknown on last tuesday");
    }

    #[test]
    fn navigation_is_grafted_with_active_page() {
        let nav = NavTree {
            roots: vec![NavNode {
                title: "Root".to_string(),
                href: Some("file:///x/pages/1.html".to_string()),
                children: vec![NavNode {
                    title: "Self".to_string(),
                    href: Some("file:///x/pages/100.html".to_string()),
                    children: Vec::new(),
                }],
            }],
        };
        let targets = targets(&["1", "100"]);
        let media = RecordingMedia::default();
        let page = transform_page(&node("<p>x</p>"), &context(&targets, Some(&nav), &media));
        let start = page.find(SIDEBAR_START).expect("start sentinel");
        let end = page.find(SIDEBAR_END).expect("end sentinel");
        assert!(start < end);
        assert!(page.contains(r#"<aside id="sidebar">"#));
        assert!(page.contains(r#"<a href="100.html" class="active-page">Self</a>"#));
        assert!(page.contains(r#"id="sidebar-resizer""#));
        assert!(page.contains(r#"id="sidebar-toggle""#));
    }

    #[test]
    fn transform_is_repeatable() {
        let targets = targets(&["42"]);
        let media = RecordingMedia::default();
        let input = node(r#"<p><a href="/pages/42">x</a><img src="/download/a.png"></p>"#);
        let first = transform_page(&input, &context(&targets, None, &media));
        let second = transform_page(&input, &context(&targets, None, &media));
        assert_eq!(first, second);
    }

    #[test]
    fn failure_page_carries_markers() {
        let targets = targets(&[]);
        let media = RecordingMedia::default();
        let page = render_failure_page("7", "Page 7", "HTTP 500", &context(&targets, None, &media));
        assert!(page.contains(r#"<meta name="wikidump-page-id" content="7">"#));
        assert!(page.contains("HTTP 500"));
    }

    #[test]
    fn media_file_names_are_decoded_basenames() {
        assert_eq!(media_file_name("/download/a/b/c%2Fd.png?x=1").as_deref(), Some("d.png"));
        assert_eq!(media_file_name("/download/").as_deref(), None);
    }
}

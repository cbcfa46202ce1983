use maud::{DOCTYPE, Markup, html};

use crate::scan::MetadataIndex;
use crate::tree::Forest;

const INDEX_STYLE: &str = "body{font-family:sans-serif;padding:20px;}ul{list-style-type:disc;}li{margin-bottom:5px;}a{text-decoration:none;color:#0052cc;}a:hover{text-decoration:underline;}";

/// Top-level listing of every indexed page, linked into `pages/`.
pub fn render_index(index: &MetadataIndex, stylesheets: &[String], heading: &str) -> String {
    let forest = Forest::build_all(index);
    let page = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { "Index" }
                @for stylesheet in stylesheets {
                    link rel="stylesheet" href=(stylesheet.replace("../", "")) type="text/css";
                }
                style { (INDEX_STYLE) }
            }
            body {
                h1 { (heading) }
                (render_list(&forest, &forest.roots))
            }
        }
    };
    page.into_string()
}

fn render_list(forest: &Forest, ids: &[String]) -> Markup {
    html! {
        ul {
            @for id in ids {
                li {
                    a href={ "pages/" (id) ".html" } { (forest.title_of(id)) }
                    @if !forest.children_of(id).is_empty() {
                        (render_list(forest, forest.children_of(id)))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::render_index;
    use crate::scan::{IndexEntry, MetadataIndex};

    #[test]
    fn index_nests_children_and_strips_parent_prefixes() {
        let mut index = MetadataIndex::default();
        for (id, title, parent) in [("1", "Home", None), ("2", "A & B", Some("1")), ("3", "Loose", None)] {
            index.record(IndexEntry {
                id: id.to_string(),
                title: title.to_string(),
                parent_id: parent.map(ToString::to_string),
            });
        }
        let html = render_index(
            &index,
            &["../styles/site.css".to_string()],
            "Export Index",
        );
        assert!(html.contains(r#"<link rel="stylesheet" href="styles/site.css" type="text/css">"#));
        assert!(html.contains("<h1>Export Index</h1>"));
        assert!(html.contains(
            r#"<li><a href="pages/1.html">Home</a><ul><li><a href="pages/2.html">A &amp; B</a></li></ul></li>"#
        ));
        assert!(html.contains(r#"<li><a href="pages/3.html">Loose</a></li>"#));
    }

    #[test]
    fn empty_index_renders_empty_list() {
        let html = render_index(&MetadataIndex::default(), &[], "Export Index");
        assert!(html.contains("<ul></ul>"));
    }
}

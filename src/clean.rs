use scraper::node::Node;
use scraper::{ElementRef, Html};

/// Tags dropped together with their content.
const DROP_TAGS: &[&str] = &["script", "style", "noscript", "svg", "img", "iframe"];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "input", "link", "meta", "source", "track", "wbr",
];

/// Strip a page down to its structure and text: noisy tags are removed and
/// every attribute is dropped, except `href` on links when `keep_links`.
pub fn clean_html(markup: &str, keep_links: bool) -> String {
    let doc = Html::parse_document(markup);
    let mut out = String::with_capacity(markup.len() / 2);
    write_element(doc.root_element(), keep_links, &mut out);
    out
}

fn write_element(el: ElementRef<'_>, keep_links: bool, out: &mut String) {
    let name = el.value().name();
    if DROP_TAGS.contains(&name) {
        return;
    }

    out.push('<');
    out.push_str(name);
    if keep_links && name == "a" {
        if let Some(href) = el.value().attr("href") {
            out.push_str(" href=\"");
            escape_into(href, true, out);
            out.push('"');
        }
    }
    out.push('>');

    if VOID_TAGS.contains(&name) {
        return;
    }

    for child in el.children() {
        match child.value() {
            Node::Text(text) => escape_into(text, false, out),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    write_element(child_el, keep_links, out);
                }
            }
            _ => {}
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_into(s: &str, attr: bool, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attr => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

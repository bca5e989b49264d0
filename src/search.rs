//! Keyword search against a result page, with a per-entity cache and a
//! heuristic ranking.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::browser::Browser;
use crate::error::{HunterError, Result};
use crate::records::Seed;
use crate::store::Topic;

static A_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static H3_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h3").unwrap());
static SNIPPET_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div.VwiC3b, div.BNeawe.s3v9rd, span.st, div.s, .result__snippet").unwrap()
});

const MAX_SNIPPET_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Query text for a person and topic.
pub fn build_query(seed: &Seed, topic: Topic) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(name) = seed.name.as_deref() {
        parts.push(name);
    }
    if let Some(inst) = seed.institute.as_deref() {
        parts.push(inst);
    }
    match topic {
        Topic::Cv => parts.push("CV"),
        Topic::Group => parts.push("research group members"),
        Topic::Faculty => parts.push("faculty"),
    }
    parts.join(" ")
}

pub fn search_url(engine: &str, query: &str) -> Result<String> {
    let url = Url::parse_with_params(engine, &[("q", query)]).map_err(|e| HunterError::Fetch {
        url: engine.to_string(),
        reason: e.to_string(),
    })?;
    Ok(url.to_string())
}

/// Parse organic results out of a search engine result page.
pub fn parse_results(html: &str) -> Vec<SearchItem> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for a in doc.select(&A_SEL) {
        let Some(h3) = a.select(&H3_SEL).next() else { continue };
        let Some(url) = a.value().attr("href").and_then(result_target) else { continue };
        if !seen.insert(url.clone()) {
            continue;
        }
        items.push(SearchItem {
            title: text_of(h3),
            snippet: snippet_near(a),
            url,
        });
    }
    items
}

/// Unwrap `/url?q=` redirects and keep only external http(s) targets.
fn result_target(href: &str) -> Option<String> {
    let target = if href.starts_with("/url?") {
        let parsed = Url::parse(&format!("https://www.google.com{href}")).ok()?;
        parsed.query_pairs().find(|(k, _)| k == "q" || k == "url")?.1.into_owned()
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&target).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    if parsed.host_str().is_some_and(|h| h.contains("google.")) {
        return None;
    }
    Some(target)
}

fn snippet_near(a: ElementRef<'_>) -> String {
    for node in a.ancestors().take(MAX_SNIPPET_DEPTH) {
        let Some(container) = ElementRef::wrap(node) else { continue };
        if let Some(s) = container.select(&SNIPPET_SEL).next() {
            return text_of(s);
        }
    }
    String::new()
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keyword score; higher sorts first. The weights are a tunable default.
pub fn score(item: &SearchItem, topic: Topic, name: Option<&str>) -> i32 {
    let title = item.title.to_lowercase();
    let url = item.url.to_lowercase();
    let snippet = item.snippet.to_lowercase();
    let has = |kw: &str| title.contains(kw) || url.contains(kw);
    let mut s = 0;

    match topic {
        Topic::Cv => {
            if has("cv") || has("curriculum vitae") || has("resume") {
                s += 3;
            }
            if has("profile") || has("people") || has("faculty") || has("staff") {
                s += 2;
            }
        }
        Topic::Group => {
            if has("member") || has("people") || has("team") {
                s += 3;
            }
            if has("group") || has("lab") {
                s += 2;
            }
            if has("profile") {
                s -= 1;
            }
        }
        Topic::Faculty => {
            if has("faculty") || has("people") || has("staff") || has("directory") {
                s += 3;
            }
        }
    }

    if let Some(name) = name {
        let tokens: Vec<String> = name.split_whitespace().map(str::to_lowercase).collect();
        if !tokens.is_empty() && tokens.iter().all(|t| title.contains(t.as_str()) || snippet.contains(t.as_str())) {
            s += 2;
        }
    }
    if let Ok(u) = Url::parse(&item.url) {
        let host = u.host_str().unwrap_or_default();
        if host.ends_with(".edu") || host.contains(".edu.") || host.contains(".ac.") {
            s += 1;
        }
        if ["linkedin.com", "researchgate.net", "facebook.com", "twitter.com", "x.com"]
            .iter()
            .any(|d| host.ends_with(d))
        {
            s -= 2;
        }
    }
    s
}

/// Stable sort by descending score; ties keep engine order.
pub fn rank(mut items: Vec<SearchItem>, topic: Topic, name: Option<&str>) -> Vec<SearchItem> {
    items.sort_by_cached_key(|it| std::cmp::Reverse(score(it, topic, name)));
    items
}

/// Run one query through the browser and return ranked items.
pub async fn search(
    browser: &mut dyn Browser,
    engine: &str,
    query: &str,
    topic: Topic,
    name: Option<&str>,
    limit: usize,
) -> Result<Vec<SearchItem>> {
    let url = search_url(engine, query)?;
    browser.goto(&url).await?;
    let mut items = parse_results(&browser.content()?);
    items.truncate(limit);
    info!("Search `{}`: {} results", query, items.len());
    Ok(rank(items, topic, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::MockBrowser;
    use pretty_assertions::assert_eq;

    const SERP: &str = r#"<html><body><div id="search">
      <div class="g"><div><a href="https://www.linkedin.com/in/jane"><h3>Jane Doe - LinkedIn</h3></a></div>
        <div class="VwiC3b">Jane Doe is a chemist.</div></div>
      <div class="g"><div><a href="/url?q=https://chem.example.edu/people/jane&amp;sa=U"><h3>Jane Doe | People</h3></a></div>
        <div class="VwiC3b">Assistant Professor of Chemistry</div></div>
      <div class="g"><a href="https://chem.example.edu/people/jane"><h3>duplicate</h3></a></div>
      <div class="g"><a href="https://maps.google.com/x"><h3>Map</h3></a></div>
      <a href="https://example.org/no-heading">plain link</a>
    </div></body></html>"#;

    #[test]
    fn parses_and_unwraps_results() {
        let items = parse_results(SERP);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://www.linkedin.com/in/jane");
        assert_eq!(items[0].snippet, "Jane Doe is a chemist.");
        assert_eq!(items[1].url, "https://chem.example.edu/people/jane");
        assert_eq!(items[1].title, "Jane Doe | People");
        assert_eq!(items[1].snippet, "Assistant Professor of Chemistry");
    }

    #[test]
    fn ranking_prefers_institution_pages() {
        let ranked = rank(parse_results(SERP), Topic::Cv, Some("Jane Doe"));
        assert_eq!(ranked[0].url, "https://chem.example.edu/people/jane");
    }

    #[test]
    fn group_ranking_prefers_members_over_profile() {
        let items = vec![
            SearchItem { title: "Jane Doe profile".into(), url: "https://a.edu/profile/jane".into(), snippet: String::new() },
            SearchItem { title: "Doe Lab members".into(), url: "https://a.edu/doelab/members".into(), snippet: String::new() },
        ];
        let ranked = rank(items, Topic::Group, None);
        assert_eq!(ranked[0].title, "Doe Lab members");
    }

    #[test]
    fn ties_keep_engine_order() {
        let items: Vec<SearchItem> = (0..3)
            .map(|i| SearchItem { title: format!("r{i}"), url: format!("https://x.org/{i}"), snippet: String::new() })
            .collect();
        let ranked = rank(items.clone(), Topic::Cv, None);
        assert_eq!(ranked, items);
    }

    #[test]
    fn query_and_url() {
        let seed = Seed::from_person("Jane Doe", Some("Example U"));
        assert_eq!(build_query(&seed, Topic::Cv), "Jane Doe Example U CV");
        let url = search_url("https://www.google.com/search", "Jane Doe CV").unwrap();
        assert_eq!(url, "https://www.google.com/search?q=Jane+Doe+CV");
    }

    #[tokio::test]
    async fn search_through_browser() {
        let url = search_url("https://www.google.com/search", "Jane Doe CV").unwrap();
        let mut browser = MockBrowser::default().with_page(&url, SERP);
        let items = search(&mut browser, "https://www.google.com/search", "Jane Doe CV", Topic::Cv, Some("Jane Doe"), 10)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(browser.visits(), 1);
    }
}

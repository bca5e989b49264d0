//! Google Scholar author search.
//!
//! Results are appended to a JSONL file one article at a time, and articles
//! already in the file are not fetched again, so an interrupted search picks
//! up where it stopped.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::browser::Browser;
use crate::config::ScholarSettings;
use crate::error::{HunterError, Result};
use crate::store::{append_jsonl, load_jsonl};

pub const RESULT_FILE: &str = "gs_result.jsonl";
const PAGE_SIZE: usize = 10;
const RESULTS_CONTAINER: &str = "#gs_res_ccl_mid";

static ARTICLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.gs_r.gs_or.gs_scl").unwrap());
static TITLE_LINK_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h3.gs_rt a").unwrap());
static PROFILE_LINK_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.gs_a a").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Citation {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub authors: Vec<String>,
    pub journal: String,
    pub volume: String,
    pub number: String,
    pub pages: String,
    pub year: String,
    pub publisher: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GsProfileEntry {
    pub name: String,
    pub url: String,
}

/// One line of the result file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GsSearchItem {
    pub url: String,
    pub citation: Citation,
    #[serde(default)]
    pub profiles: Vec<GsProfileEntry>,
}

/// Parse an EndNote export:
///
/// ```text
/// %0 Journal Article
/// %T Theoretical studies on anatase
/// %A De Angelis, Filippo
/// %J Chemical reviews
/// %D 2014
/// ```
pub fn parse_endnote(text: &str) -> Citation {
    let mut c = Citation::default();
    for line in text.lines() {
        let Some(rest) = line.strip_prefix('%') else { continue };
        let Some((tag, value)) = rest.split_once(' ') else { continue };
        let value = value.trim().to_string();
        match tag {
            "0" => c.kind = value,
            "T" => c.title = value,
            "A" => c.authors.push(value),
            "J" => c.journal = value,
            "V" => c.volume = value,
            "N" => c.number = value,
            "P" => c.pages = value,
            "D" => c.year = value,
            "I" => c.publisher = value,
            _ => {}
        }
    }
    c
}

/// The `user` query parameter of a profile URL.
pub fn profile_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url)
        .or_else(|_| Url::parse("https://scholar.google.com").and_then(|b| b.join(url)))
        .ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "user")
        .map(|(_, v)| v.into_owned())
}

/// Distinct author profile URLs in a result file, sorted.
pub fn list_profile_urls(result_file: &Path) -> Result<Vec<String>> {
    let items: Vec<GsSearchItem> = load_jsonl(result_file)?;
    let urls: BTreeSet<String> = items
        .into_iter()
        .flat_map(|it| it.profiles.into_iter().map(|p| p.url))
        .collect();
    Ok(urls.into_iter().collect())
}

fn scholar_url(base: &str, params: &[(&str, &str)]) -> Result<String> {
    let url = Url::parse(base)
        .and_then(|b| b.join("/scholar"))
        .and_then(|u| Url::parse_with_params(u.as_str(), params))
        .map_err(|e| HunterError::Fetch { url: base.to_string(), reason: e.to_string() })?;
    Ok(url.to_string())
}

pub fn search_page_url(base: &str, author: &str, page: usize) -> Result<String> {
    let query = format!("author:\"{author}\"");
    let start = (page * PAGE_SIZE).to_string();
    scholar_url(base, &[("hl", "en"), ("q", &query), ("start", &start)])
}

pub fn cite_url(base: &str, cid: &str) -> Result<String> {
    let query = format!("info:{cid}:scholar.google.com/");
    scholar_url(base, &[("q", &query), ("output", "cite"), ("hl", "en")])
}

fn absolute(base: &str, href: &str) -> String {
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ArticleRef {
    url: String,
    cid: String,
    profiles: Vec<GsProfileEntry>,
}

fn parse_articles(html: &str, base: &str) -> Vec<ArticleRef> {
    let doc = Html::parse_document(html);
    doc.select(&ARTICLE_SEL)
        .filter_map(|div| {
            let link = div.select(&TITLE_LINK_SEL).next()?;
            let url = link.value().attr("href")?.to_string();
            let cid = div
                .value()
                .attr("data-cid")
                .or_else(|| link.value().attr("id"))?
                .to_string();
            let profiles = div
                .select(&PROFILE_LINK_SEL)
                .filter_map(|a| {
                    let href = a.value().attr("href")?;
                    Some(GsProfileEntry {
                        name: a.text().collect::<String>().trim().to_string(),
                        url: absolute(base, href),
                    })
                })
                .collect();
            Some(ArticleRef { url, cid, profiles })
        })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScholarReport {
    pub appended: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Open the cite dialog of an article and follow its EndNote link.
async fn fetch_citation(browser: &mut dyn Browser, base: &str, cid: &str) -> Result<Citation> {
    browser.goto(&cite_url(base, cid)?).await?;
    let links = browser.evaluate("a.gs_citi")?;
    let href = links
        .as_array()
        .into_iter()
        .flatten()
        .find(|l| l.get("text").and_then(Value::as_str) == Some("EndNote"))
        .and_then(|l| l.get("href").and_then(Value::as_str))
        .map(|h| absolute(base, h))
        .ok_or_else(|| HunterError::Fetch {
            url: cid.to_string(),
            reason: "no EndNote export link".into(),
        })?;
    browser.goto(&href).await?;
    Ok(parse_endnote(&browser.content()?))
}

/// Search each author over up to `settings.page_limit` result pages and
/// append every new article to `result_file`.
pub async fn search_by_authors(
    browser: &mut dyn Browser,
    settings: &ScholarSettings,
    wait: Duration,
    authors: &[String],
    result_file: &Path,
) -> Result<ScholarReport> {
    let mut processed: HashSet<String> = if result_file.exists() {
        load_jsonl::<GsSearchItem>(result_file)?.into_iter().map(|it| it.url).collect()
    } else {
        HashSet::new()
    };
    let base = settings.base_url.as_str();
    let mut report = ScholarReport::default();

    for author in authors {
        for page in 0..settings.page_limit {
            browser.goto(&search_page_url(base, author, page)?).await?;
            browser.wait_for_selector(RESULTS_CONTAINER, wait).await?;
            let articles = parse_articles(&browser.content()?, base);
            if articles.is_empty() {
                info!("{}: no more results after page {}", author, page);
                break;
            }

            for article in articles {
                if processed.contains(&article.url) {
                    info!("Article {} already processed", article.url);
                    report.skipped += 1;
                    continue;
                }
                let citation = match fetch_citation(browser, base, &article.cid).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Citation for {} failed: {}", article.url, e);
                        report.failed += 1;
                        continue;
                    }
                };
                let item = GsSearchItem {
                    url: article.url,
                    citation,
                    profiles: article.profiles,
                };
                append_jsonl(result_file, &item)?;
                processed.insert(item.url);
                report.appended += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::MockBrowser;
    use pretty_assertions::assert_eq;

    const ENDNOTE: &str = "%0 Journal Article\n%T Theoretical studies on anatase \n%A De Angelis, Filippo\n%A Selloni, Annabella\n%J Chemical reviews\n%V 114\n%N 19\n%P 9708-9753\n%@ 0009-2665\n%D 2014\n%I ACS Publications\n";

    const BASE: &str = "https://scholar.google.com";

    fn results_page(articles: &[(&str, &str)]) -> String {
        let body: String = articles
            .iter()
            .map(|(cid, url)| {
                format!(
                    r#"<div class="gs_r gs_or gs_scl" data-cid="{cid}"><h3 class="gs_rt"><a id="{cid}" href="{url}">Paper {cid}</a></h3>
                       <div class="gs_a"><a href="/citations?user=U{cid}&amp;hl=en">A Author</a> - Journal</div></div>"#
                )
            })
            .collect();
        format!(r#"<html><body><div id="gs_res_ccl_mid">{body}</div></body></html>"#)
    }

    fn cite_page(cid: &str) -> String {
        format!(
            r#"<div id="gs_citi"><a class="gs_citi" href="/scholar.bib?q=info:{cid}">BibTeX</a><a class="gs_citi" href="/scholar.enw?q=info:{cid}">EndNote</a></div>"#
        )
    }

    fn browser_for(author: &str, pages: &[Vec<(&str, &str)>]) -> MockBrowser {
        let mut b = MockBrowser::default();
        for (i, arts) in pages.iter().enumerate() {
            b = b.with_page(&search_page_url(BASE, author, i).unwrap(), &results_page(arts));
            for (cid, _) in arts {
                b = b
                    .with_page(&cite_url(BASE, cid).unwrap(), &cite_page(cid))
                    .with_page(&format!("{BASE}/scholar.enw?q=info:{cid}"), ENDNOTE);
            }
        }
        b
    }

    #[test]
    fn endnote_fields() {
        let c = parse_endnote(ENDNOTE);
        assert_eq!(c.kind, "Journal Article");
        assert_eq!(c.title, "Theoretical studies on anatase");
        assert_eq!(c.authors, vec!["De Angelis, Filippo", "Selloni, Annabella"]);
        assert_eq!(c.volume, "114");
        assert_eq!(c.pages, "9708-9753");
        assert_eq!(c.year, "2014");
        assert_eq!(c.publisher, "ACS Publications");
    }

    #[test]
    fn profile_id_reads_user_param() {
        assert_eq!(
            profile_id("https://scholar.google.com/citations?user=abc123&hl=en").as_deref(),
            Some("abc123")
        );
        assert_eq!(profile_id("/citations?hl=en&user=xyz").as_deref(), Some("xyz"));
        assert_eq!(profile_id("https://scholar.google.com/citations?hl=en"), None);
    }

    #[test]
    fn articles_and_profiles_are_parsed() {
        let arts = parse_articles(&results_page(&[("c1", "https://pubs.org/1")]), BASE);
        assert_eq!(arts.len(), 1);
        assert_eq!(arts[0].cid, "c1");
        assert_eq!(arts[0].profiles[0].name, "A Author");
        assert_eq!(arts[0].profiles[0].url, "https://scholar.google.com/citations?user=Uc1&hl=en");
    }

    #[tokio::test]
    async fn search_appends_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join(RESULT_FILE);
        let settings = ScholarSettings { base_url: BASE.into(), page_limit: 3 };
        let authors = vec!["Jane Doe".to_string()];
        let pages = vec![vec![("c1", "https://pubs.org/1"), ("c2", "https://pubs.org/2")], vec![]];

        let mut browser = browser_for("Jane Doe", &pages);
        let report = search_by_authors(&mut browser, &settings, Duration::from_millis(20), &authors, &out)
            .await
            .unwrap();
        assert_eq!(report, ScholarReport { appended: 2, skipped: 0, failed: 0 });
        // two result pages plus two fetches per article
        assert_eq!(browser.visits(), 6);

        let items: Vec<GsSearchItem> = load_jsonl(&out).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].citation.journal, "Chemical reviews");

        let mut again = browser_for("Jane Doe", &pages);
        let report = search_by_authors(&mut again, &settings, Duration::from_millis(20), &authors, &out)
            .await
            .unwrap();
        assert_eq!(report, ScholarReport { appended: 0, skipped: 2, failed: 0 });
        assert_eq!(again.visits(), 2);

        let urls = list_profile_urls(&out).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://scholar.google.com/citations?user=Uc1&hl=en",
                "https://scholar.google.com/citations?user=Uc2&hl=en",
            ]
        );
    }

    #[tokio::test]
    async fn missing_export_link_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join(RESULT_FILE);
        let settings = ScholarSettings { base_url: BASE.into(), page_limit: 1 };
        let mut browser = MockBrowser::default()
            .with_page(&search_page_url(BASE, "X", 0).unwrap(), &results_page(&[("c9", "https://pubs.org/9")]))
            .with_page(&cite_url(BASE, "c9").unwrap(), "<div>no links</div>");

        let report = search_by_authors(&mut browser, &settings, Duration::from_millis(20), &["X".to_string()], &out)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert!(!out.exists());
    }
}

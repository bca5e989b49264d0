//! The browser capability: navigate, read the rendered page, wait for an
//! element, and run selector queries over the DOM.
//!
//! One browser instance is reused for a whole run and driven sequentially.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, info};

use crate::config::{Backend, BrowserSettings};
use crate::error::{HunterError, Result};

#[async_trait]
pub trait Browser: Send {
    /// Navigate to `url` and wait until the document is loaded.
    async fn goto(&mut self, url: &str) -> Result<()>;

    /// HTML of the current page.
    fn content(&self) -> Result<String>;

    /// URL of the current page after redirects.
    fn current_url(&self) -> Option<&str>;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Wait until `selector` matches something on the current page,
    /// reloading it between checks.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if has_selector(&self.content()?, selector)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HunterError::SelectorTimeout {
                    selector: selector.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval()).await;
            let url = self.current_url().map(str::to_string).ok_or(HunterError::NoPage)?;
            self.goto(&url).await?;
        }
    }

    /// Run a CSS selector query over the current page. Returns a JSON array
    /// of `{text, href}` objects, one per matched element.
    fn evaluate(&self, query: &str) -> Result<Value> {
        select_all(&self.content()?, query)
    }
}

pub fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|_| HunterError::BadSelector(selector.to_string()))
}

pub fn has_selector(html: &str, selector: &str) -> Result<bool> {
    let sel = parse_selector(selector)?;
    let doc = Html::parse_document(html);
    let found = doc.select(&sel).next().is_some();
    Ok(found)
}

pub fn select_all(html: &str, selector: &str) -> Result<Value> {
    let sel = parse_selector(selector)?;
    let doc = Html::parse_document(html);
    let items: Vec<Value> = doc
        .select(&sel)
        .map(|el| {
            let text = el.text().collect::<Vec<_>>().join(" ");
            json!({
                "text": collapse_ws(&text),
                "href": el.value().attr("href").unwrap_or_default(),
            })
        })
        .collect();
    Ok(Value::Array(items))
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether the URL's path ends with one of the blocked extensions.
pub fn is_blocked(url: &str, extensions: &[String]) -> bool {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let last = path.rsplit('/').next().unwrap_or_default();
    match last.rsplit_once('.') {
        Some((_, ext)) => extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
        None => false,
    }
}

struct Page {
    url: String,
    html: String,
}

/// Static fetch over HTTP. Fast, no JavaScript.
pub struct HttpBrowser {
    client: reqwest::Client,
    blocked: Vec<String>,
    poll: Duration,
    page: Option<Page>,
}

impl HttpBrowser {
    pub fn new(cfg: &BrowserSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .danger_accept_invalid_certs(true);
        if let Some(proxy) = cfg.proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(HttpBrowser {
            client: builder.build()?,
            blocked: cfg.block_extensions.clone(),
            poll: Duration::from_millis(cfg.wait_poll_ms),
            page: None,
        })
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn goto(&mut self, url: &str) -> Result<()> {
        if is_blocked(url, &self.blocked) {
            return Err(HunterError::Blocked { url: url.to_string() });
        }
        debug!("GET {}", url);
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let final_url = resp.url().to_string();
        let html = resp.text().await?;
        self.page = Some(Page { url: final_url, html });
        Ok(())
    }

    fn content(&self) -> Result<String> {
        self.page.as_ref().map(|p| p.html.clone()).ok_or(HunterError::NoPage)
    }

    fn current_url(&self) -> Option<&str> {
        self.page.as_ref().map(|p| p.url.as_str())
    }

    fn poll_interval(&self) -> Duration {
        self.poll
    }
}

/// Rendered fetch through spider.cloud.
pub struct SpiderBrowser {
    spider: Spider,
    blocked: Vec<String>,
    poll: Duration,
    page: Option<Page>,
}

impl SpiderBrowser {
    pub fn new(cfg: &BrowserSettings) -> Result<Self> {
        let api_key = std::env::var("SPIDER_API_KEY").map_err(|_| HunterError::Fetch {
            url: "spider.cloud".into(),
            reason: "SPIDER_API_KEY environment variable must be set".into(),
        })?;
        let spider = Spider::new(Some(api_key)).map_err(|e| HunterError::Fetch {
            url: "spider.cloud".into(),
            reason: format!("failed to create Spider client: {}", e),
        })?;
        Ok(SpiderBrowser {
            spider,
            blocked: cfg.block_extensions.clone(),
            poll: Duration::from_millis(cfg.wait_poll_ms),
            page: None,
        })
    }
}

#[async_trait]
impl Browser for SpiderBrowser {
    async fn goto(&mut self, url: &str) -> Result<()> {
        if is_blocked(url, &self.blocked) {
            return Err(HunterError::Blocked { url: url.to_string() });
        }
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };
        let start = Instant::now();
        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| HunterError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!("spider {} in {}ms", url, start.elapsed().as_millis());

        let parsed: Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());
        let html = first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| HunterError::Fetch {
                url: url.to_string(),
                reason: "no content in spider response".into(),
            })?;
        let final_url = first
            .and_then(|obj| obj.get("url"))
            .and_then(|u| u.as_str())
            .unwrap_or(url);

        self.page = Some(Page {
            url: final_url.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }

    fn content(&self) -> Result<String> {
        self.page.as_ref().map(|p| p.html.clone()).ok_or(HunterError::NoPage)
    }

    fn current_url(&self) -> Option<&str> {
        self.page.as_ref().map(|p| p.url.as_str())
    }

    fn poll_interval(&self) -> Duration {
        self.poll
    }
}

pub fn launch(cfg: &BrowserSettings) -> Result<Box<dyn Browser>> {
    info!("Launching {:?} browser", cfg.backend);
    Ok(match cfg.backend {
        Backend::Http => Box::new(HttpBrowser::new(cfg)?),
        Backend::Spider => Box::new(SpiderBrowser::new(cfg)?),
    })
}

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

/// Extract the page `<title>` for logs.
pub fn page_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .map(|c| collapse_ws(&c[1]))
        .filter(|t| !t.is_empty())
}

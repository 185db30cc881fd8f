//! Vacancy source contracts, the hh.ru-style HTTP source, a fixture-backed
//! source, and the JSON decoder for listing and detail payloads.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use vacsync_core::{ListingPage, VacancyRecord};
use vacsync_storage::{FetchError, HttpClientConfig, HttpFetcher, Url};

pub const CRATE_NAME: &str = "vacsync-adapters";

pub const DEFAULT_API_BASE: &str = "https://api.hh.ru/vacancies";

/// Listing request: optional name text plus paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingQuery {
    pub text: Option<String>,
    pub page: u32,
    pub per_page: u32,
}

impl ListingQuery {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            text: None,
            page,
            per_page,
        }
    }

    pub fn with_text(mut self, text: impl AsRef<str>) -> Self {
        self.text = Some(text.as_ref().to_string());
        self
    }

    /// Name text with whitespace runs collapsed; `None` when blank.
    pub fn normalized_text(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(collapse_whitespace)
            .filter(|t| !t.is_empty())
    }

    /// `?text=..&search_field=name&page=..&per_page=..`, or paging only.
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            if let Some(text) = self.normalized_text() {
                pairs.append_pair("text", &text);
                pairs.append_pair("search_field", "name");
            }
            pairs.append_pair("page", &self.page.to_string());
            pairs.append_pair("per_page", &self.per_page.to_string());
        }
        url
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
pub trait VacancySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(&self, query: &ListingQuery) -> Result<String, FetchError>;

    async fn fetch_detail(&self, id: &str) -> Result<String, FetchError>;
}

/// Live source for an hh.ru-compatible vacancies endpoint.
#[derive(Debug, Clone)]
pub struct HhApiSource {
    http: HttpFetcher,
    base: Url,
}

impl HhApiSource {
    pub fn new(base: &str, http: HttpClientConfig) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("parsing api base {base}"))?;
        let http = HttpFetcher::new(http)?;
        Ok(Self { http, base })
    }

    pub fn detail_url(&self, id: &str) -> Result<Url, FetchError> {
        let id = id.trim();
        if id.is_empty() || id.contains('/') {
            return Err(FetchError::InvalidUrl {
                url: format!("{}/{id}", self.base),
                reason: "vacancy id must be a single non-empty path segment".to_string(),
            });
        }
        let mut url = self.base.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|()| FetchError::InvalidUrl {
                url: self.base.to_string(),
                reason: "base url cannot carry path segments".to_string(),
            })?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }
}

#[async_trait]
impl VacancySource for HhApiSource {
    fn source_id(&self) -> &'static str {
        "hh-api"
    }

    async fn fetch_listing(&self, query: &ListingQuery) -> Result<String, FetchError> {
        let url = query.to_url(&self.base);
        Ok(self.http.fetch_text(&url).await?.body)
    }

    async fn fetch_detail(&self, id: &str) -> Result<String, FetchError> {
        let url = self.detail_url(id)?;
        Ok(self.http.fetch_text(&url).await?.body)
    }
}

/// Canned response of a [`FixtureSource`].
#[derive(Debug, Clone)]
enum Canned {
    Body(String),
    Status(u16),
}

impl Canned {
    fn respond(&self, url: &str) -> Result<String, FetchError> {
        match self {
            Canned::Body(body) => Ok(body.clone()),
            Canned::Status(status) => Err(FetchError::HttpStatus {
                status: *status,
                url: url.to_string(),
            }),
        }
    }
}

/// Offline source serving stored JSON; unknown requests answer 404.
#[derive(Debug, Default)]
pub struct FixtureSource {
    listing: Option<Canned>,
    details: HashMap<String, Canned>,
    requests: Mutex<Vec<String>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `listing.json` and every `<id>.json` under `dir/detail/`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut source = Self::new();

        let listing_path = dir.join("listing.json");
        if listing_path.exists() {
            let body = fs::read_to_string(&listing_path)
                .with_context(|| format!("reading {}", listing_path.display()))?;
            source = source.with_listing(body);
        }

        let detail_dir = dir.join("detail");
        if detail_dir.is_dir() {
            for entry in fs::read_dir(&detail_dir)
                .with_context(|| format!("listing {}", detail_dir.display()))?
            {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let body = fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                source = source.with_detail(id, body);
            }
        }
        Ok(source)
    }

    pub fn with_listing(mut self, body: impl Into<String>) -> Self {
        self.listing = Some(Canned::Body(body.into()));
        self
    }

    pub fn with_listing_status(mut self, status: u16) -> Self {
        self.listing = Some(Canned::Status(status));
        self
    }

    pub fn with_detail(mut self, id: impl Into<String>, body: impl Into<String>) -> Self {
        self.details.insert(id.into(), Canned::Body(body.into()));
        self
    }

    pub fn with_detail_status(mut self, id: impl Into<String>, status: u16) -> Self {
        self.details.insert(id.into(), Canned::Status(status));
        self
    }

    /// Request descriptions seen so far, oldest first.
    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }

    async fn record(&self, request: String) {
        self.requests.lock().await.push(request);
    }
}

#[async_trait]
impl VacancySource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_listing(&self, query: &ListingQuery) -> Result<String, FetchError> {
        let base = Url::parse(DEFAULT_API_BASE).map_err(|err| FetchError::InvalidUrl {
            url: DEFAULT_API_BASE.to_string(),
            reason: err.to_string(),
        })?;
        let url = query.to_url(&base).to_string();
        self.record(url.clone()).await;
        match &self.listing {
            Some(canned) => canned.respond(&url),
            None => Err(FetchError::HttpStatus { status: 404, url }),
        }
    }

    async fn fetch_detail(&self, id: &str) -> Result<String, FetchError> {
        let url = format!("{DEFAULT_API_BASE}/{id}");
        self.record(url.clone()).await;
        match self.details.get(id) {
            Some(canned) => canned.respond(&url),
            None => Err(FetchError::HttpStatus { status: 404, url }),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

fn decode<T: serde::de::DeserializeOwned>(text: &str, shape: &'static str) -> Result<T, DecodeError> {
    let span = info_span!("decode", shape, bytes = text.len());
    let _guard = span.enter();
    if text.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    let value = serde_json::from_str(text)?;
    debug!("payload decoded");
    Ok(value)
}

pub fn decode_listing(text: &str) -> Result<ListingPage, DecodeError> {
    decode(text, "listing")
}

pub fn decode_detail(text: &str) -> Result<VacancyRecord, DecodeError> {
    decode(text, "detail")
}

/// Fetch and decode one listing page.
pub async fn load_listing(
    source: &dyn VacancySource,
    query: &ListingQuery,
) -> Result<ListingPage, LoadError> {
    let span = info_span!("load_listing", source = source.source_id(), page = query.page);
    async move {
        let text = source.fetch_listing(query).await?;
        Ok(decode_listing(&text)?)
    }
    .instrument(span)
    .await
}

/// Fetch and decode one vacancy.
pub async fn load_detail(source: &dyn VacancySource, id: &str) -> Result<VacancyRecord, LoadError> {
    let span = info_span!("load_detail", source = source.source_id(), id);
    async move {
        let text = source.fetch_detail(id).await?;
        Ok(decode_detail(&text)?)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

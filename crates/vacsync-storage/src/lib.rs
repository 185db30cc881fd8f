//! Persistence boundary and HTTP fetch utilities for vacsync.
//!
//! A [`Store`] hands out one [`UnitOfWork`] per reconciliation step. The unit
//! buffers adds, modifications and removals in a [`ChangeSet`] and writes
//! them atomically on [`UnitOfWork::commit`]; dropping an uncommitted unit
//! discards its pending writes.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use vacsync_core::{
    Address, Contacts, Employment, Entity, EntityKind, PageQuery, Phone, Salary, TypeVacancy,
    Vacancy, VacancyGraph, VacancyPage,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use reqwest::Url;

pub const CRATE_NAME: &str = "vacsync-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} storage unavailable: {reason}")]
    Unavailable { kind: EntityKind, reason: String },
    #[error("{kind} {key} conflicts with the stored state")]
    Conflict { kind: EntityKind, key: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// State of one key inside an uncommitted unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending<E> {
    Added(E),
    Modified(E),
    Removed,
}

/// Pending writes for one entity kind, keyed by identity.
#[derive(Debug, Clone)]
pub struct PendingTable<E: Entity> {
    entries: BTreeMap<E::Key, Pending<E>>,
}

impl<E: Entity> Default for PendingTable<E> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<E: Entity> PendingTable<E> {
    pub fn add(&mut self, entity: E) {
        let key = entity.key().clone();
        self.entries.insert(key, Pending::Added(entity));
    }

    /// A modification of a key added in the same unit stays an insert.
    pub fn modify(&mut self, entity: E) {
        let key = entity.key().clone();
        match self.entries.get_mut(&key) {
            Some(Pending::Added(existing)) => *existing = entity,
            _ => {
                self.entries.insert(key, Pending::Modified(entity));
            }
        }
    }

    pub fn remove(&mut self, key: E::Key) {
        if let Some(Pending::Added(_)) = self.entries.get(&key) {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, Pending::Removed);
        }
    }

    /// `Some(None)` means the key is pending removal; `None` means untouched.
    pub fn get(&self, key: &E::Key) -> Option<Option<&E>> {
        self.entries.get(key).map(|pending| match pending {
            Pending::Added(entity) | Pending::Modified(entity) => Some(entity),
            Pending::Removed => None,
        })
    }

    pub fn find_same(&self, candidate: &E) -> Option<&E> {
        self.entries.values().find_map(|pending| match pending {
            Pending::Added(entity) | Pending::Modified(entity) if entity.same_identity(candidate) => {
                Some(entity)
            }
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&E::Key, &Pending<E>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All pending writes of one unit of work.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub type_vacancies: PendingTable<TypeVacancy>,
    pub employments: PendingTable<Employment>,
    pub vacancies: PendingTable<Vacancy>,
    pub addresses: PendingTable<Address>,
    pub salaries: PendingTable<Salary>,
    pub contacts: PendingTable<Contacts>,
    pub phones: PendingTable<Phone>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.type_vacancies.len()
            + self.employments.len()
            + self.vacancies.len()
            + self.addresses.len()
            + self.salaries.len()
            + self.contacts.len()
            + self.phones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Selects the pending table of an entity kind inside a [`ChangeSet`].
pub trait StoredEntity: Entity {
    fn pending(changes: &ChangeSet) -> &PendingTable<Self>;
    fn pending_mut(changes: &mut ChangeSet) -> &mut PendingTable<Self>;
}

macro_rules! stored_entity {
    ($($ty:ty => $field:ident),+ $(,)?) => {
        $(
            impl StoredEntity for $ty {
                fn pending(changes: &ChangeSet) -> &PendingTable<Self> {
                    &changes.$field
                }

                fn pending_mut(changes: &mut ChangeSet) -> &mut PendingTable<Self> {
                    &mut changes.$field
                }
            }
        )+
    };
}

stored_entity!(
    TypeVacancy => type_vacancies,
    Employment => employments,
    Vacancy => vacancies,
    Address => addresses,
    Salary => salaries,
    Contacts => contacts,
    Phone => phones,
);

/// Per-kind primitives of the persistence boundary.
#[async_trait]
pub trait EntitySet<E: Entity>: Send {
    async fn find_by_key(&mut self, key: &E::Key) -> Result<Option<E>, StorageError>;

    /// Stored instance with the same identity as `candidate`, per `E::IDENTITY`.
    async fn find_same(&mut self, candidate: &E) -> Result<Option<E>, StorageError>;

    fn add(&mut self, entity: E);

    fn mark_modified(&mut self, entity: E);

    fn remove(&mut self, key: E::Key);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Transactional unit covering every entity kind.
#[async_trait]
pub trait UnitOfWork:
    EntitySet<TypeVacancy>
    + EntitySet<Employment>
    + EntitySet<Vacancy>
    + EntitySet<Address>
    + EntitySet<Salary>
    + EntitySet<Contacts>
    + EntitySet<Phone>
    + Send
    + Sized
{
    /// Write every pending change in one transaction.
    async fn commit(self) -> Result<CommitSummary, StorageError>;
}

/// Source of units of work plus the read accessors that bypass ingestion.
#[async_trait]
pub trait Store: Send + Sync {
    type Unit: UnitOfWork + 'static;

    async fn begin(&self) -> Result<Self::Unit, StorageError>;

    async fn find_vacancy(&self, id: &str) -> Result<Option<VacancyGraph>, StorageError>;

    /// Vacancies ordered by id descending, optionally filtered by exact name.
    async fn list_vacancies(&self, query: &PageQuery) -> Result<VacancyPage, StorageError>;
}

/// `(pages, page)` for `found` rows under `query`.
pub fn page_numbers(found: u64, query: &PageQuery) -> (u64, u64) {
    let size = query.size.max(1);
    (found.div_ceil(size), query.offset / size)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some("HH-User-Agent".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// JSON GET client. Failures are returned as-is; nothing is retried here.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &Url) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = %url);
        async move {
            let resp = self.client.get(url.clone()).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await?;
            debug!(bytes = body.len(), "fetched response body");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    type Seen = Arc<Mutex<Vec<String>>>;

    /// Answers `/ok` with JSON, `/slow` after two seconds, anything else 503.
    async fn serve_canned() -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind local listener");
        let addr = listener.local_addr().expect("listener address");
        let seen: Seen = Arc::default();
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(answer(socket, log.clone()));
            }
        });
        (format!("http://{addr}"), seen)
    }

    async fn answer(mut socket: TcpStream, seen: Seen) {
        let mut head = Vec::new();
        let mut chunk = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&chunk[..n]),
            }
        }
        let head = String::from_utf8_lossy(&head).to_string();
        let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
        seen.lock().await.push(head);

        let (status, body) = match path.as_str() {
            "/ok" => ("200 OK", r#"{"items":[]}"#),
            "/slow" => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                ("200 OK", "{}")
            }
            _ => ("503 Service Unavailable", "down"),
        };
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
    }

    fn fetcher(timeout: Duration) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some("vacsync-test".to_string()),
        })
        .expect("build fetcher")
    }

    fn url(base: &str, path: &str) -> Url {
        Url::parse(&format!("{base}{path}")).expect("test url")
    }

    fn salary(id: &str, to: &str) -> Salary {
        Salary {
            id: id.to_string(),
            to: Some(to.to_string()),
            ..Salary::default()
        }
    }

    #[test]
    fn modify_after_add_stays_an_insert() {
        let mut table = PendingTable::<Salary>::default();
        table.add(salary("1", "2000"));
        table.modify(salary("1", "2500"));

        let (_, pending) = table.iter().next().expect("pending entry");
        assert_eq!(pending, &Pending::Added(salary("1", "2500")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_of_pending_insert_cancels_it() {
        let mut table = PendingTable::<Salary>::default();
        table.add(salary("1", "2000"));
        table.remove("1".to_string());
        assert!(table.is_empty());

        table.remove("2".to_string());
        assert_eq!(table.get(&"2".to_string()), Some(None));
        assert_eq!(table.get(&"3".to_string()), None);
    }

    #[test]
    fn find_same_uses_entity_identity_rule() {
        let mut table = PendingTable::<Phone>::default();
        let stored = Phone {
            id: Uuid::new_v4(),
            country: Some("7".into()),
            city: Some("495".into()),
            number: Some("1".into()),
            note: None,
            contacts_id: "10".into(),
        };
        table.add(stored.clone());

        let candidate = Phone {
            id: Uuid::nil(),
            number: Some("2".into()),
            ..stored.clone()
        };
        assert_eq!(table.find_same(&candidate), Some(&stored));

        let other_city = Phone {
            city: Some("812".into()),
            ..candidate
        };
        assert_eq!(table.find_same(&other_city), None);
    }

    #[test]
    fn change_set_counts_every_kind() {
        let mut changes = ChangeSet::default();
        <Salary as StoredEntity>::pending_mut(&mut changes).add(salary("1", "2000"));
        <Vacancy as StoredEntity>::pending_mut(&mut changes).add(Vacancy {
            id: "1".into(),
            ..Vacancy::default()
        });
        assert_eq!(changes.len(), 2);
        assert!(!changes.is_empty());
    }

    #[tokio::test]
    async fn fetch_text_returns_body_and_sends_json_headers() {
        let (base, seen) = serve_canned().await;
        let response = fetcher(Duration::from_secs(5))
            .fetch_text(&url(&base, "/ok"))
            .await
            .expect("200 response");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, r#"{"items":[]}"#);
        assert!(response.final_url.ends_with("/ok"));

        let requests = seen.lock().await;
        let head = requests[0].to_lowercase();
        assert!(head.starts_with("get /ok "));
        assert!(head.contains("accept: application/json"));
        assert!(head.contains("user-agent: vacsync-test"));
    }

    #[tokio::test]
    async fn non_ok_status_is_reported_once_without_retry() {
        let (base, seen) = serve_canned().await;
        let err = fetcher(Duration::from_secs(5))
            .fetch_text(&url(&base, "/down"))
            .await
            .expect_err("503 must fail");

        match &err {
            FetchError::HttpStatus { status, url } => {
                assert_eq!(*status, 503);
                assert!(url.ends_with("/down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_timeout());
        assert_eq!(seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn slow_response_hits_the_client_timeout() {
        let (base, _seen) = serve_canned().await;
        let err = fetcher(Duration::from_millis(200))
            .fetch_text(&url(&base, "/slow"))
            .await
            .expect_err("slow response must time out");

        assert!(matches!(err, FetchError::Request(_)));
        assert!(err.is_timeout());
    }

    #[test]
    fn page_numbers_round_up() {
        let query = PageQuery::new(20, 10);
        assert_eq!(page_numbers(21, &query), (3, 2));
        assert_eq!(page_numbers(0, &query), (0, 2));
    }
}

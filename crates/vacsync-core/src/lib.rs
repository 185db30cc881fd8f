//! Core domain model, decoded record graph, and reconciliation outcome types for vacsync.

use std::fmt::{self, Debug, Display};
use std::hash::Hash;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod de;

pub const CRATE_NAME: &str = "vacsync-core";

/// The seven persisted entity kinds, listed in reconciliation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    TypeVacancy,
    Employment,
    Vacancy,
    Address,
    Salary,
    Contacts,
    Phone,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::TypeVacancy => "type_vacancy",
            EntityKind::Employment => "employment",
            EntityKind::Vacancy => "vacancy",
            EntityKind::Address => "address",
            EntityKind::Salary => "salary",
            EntityKind::Contacts => "contacts",
            EntityKind::Phone => "phone",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity key of a persisted entity.
pub trait EntityKey: Clone + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static {
    /// True when the key carries no identity (empty string, nil uuid).
    fn is_blank(&self) -> bool;
}

impl EntityKey for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl EntityKey for Uuid {
    fn is_blank(&self) -> bool {
        self.is_nil()
    }
}

/// How the upsert engine decides whether a candidate is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRule {
    /// Look the candidate up by its externally supplied key.
    NaturalKey,
    /// Match any stored phone with the same (country, city) code pair.
    PhoneCodes,
}

/// Entity-kind descriptor consumed by the generic upsert engine.
///
/// The merge rules live here: `merge_from` copies only the fields listed in
/// `MUTABLE_FIELDS` and never touches the key.
pub trait Entity: Clone + Debug + PartialEq + Send + Sync + 'static {
    type Key: EntityKey;

    const KIND: EntityKind;
    const IDENTITY: IdentityRule = IdentityRule::NaturalKey;
    /// Field names overwritten on update, in storage column order.
    const MUTABLE_FIELDS: &'static [&'static str];

    fn key(&self) -> &Self::Key;

    /// Overwrite the mutable fields from `candidate`, returning the names of
    /// the fields whose values changed.
    fn merge_from(&mut self, candidate: &Self) -> Vec<&'static str>;

    /// Name of the required identity field that is missing, if any.
    fn missing_identity(&self) -> Option<&'static str> {
        self.key().is_blank().then_some("id")
    }

    /// Whether a stored instance represents the same record as `candidate`.
    fn same_identity(&self, candidate: &Self) -> bool {
        self.key() == candidate.key()
    }

    /// Called once before a new instance is queued for insertion.
    fn prepare_insert(&mut self) {}
}

fn refresh<T: PartialEq + Clone>(
    slot: &mut T,
    incoming: &T,
    name: &'static str,
    changed: &mut Vec<&'static str>,
) {
    if slot != incoming {
        *slot = incoming.clone();
        changed.push(name);
    }
}

/// Vacancy anchor row. `type_id` and `employment_id` are set on insert and
/// never rewritten by a later sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Vacancy {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<String>,
    pub archived: bool,
    pub type_id: Option<String>,
    pub employment_id: Option<String>,
}

impl Vacancy {
    /// Publication timestamp as sent by the source (`2024-03-01T10:00:00+0300`).
    pub fn published_at_parsed(&self) -> Option<DateTime<FixedOffset>> {
        let raw = self.published_at.as_deref()?.trim();
        DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
            .or_else(|_| DateTime::parse_from_rfc3339(raw))
            .ok()
    }
}

impl Entity for Vacancy {
    type Key = String;

    const KIND: EntityKind = EntityKind::Vacancy;
    const MUTABLE_FIELDS: &'static [&'static str] =
        &["name", "description", "published_at", "archived"];

    fn key(&self) -> &String {
        &self.id
    }

    fn merge_from(&mut self, candidate: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        refresh(&mut self.name, &candidate.name, "name", &mut changed);
        refresh(&mut self.description, &candidate.description, "description", &mut changed);
        refresh(&mut self.published_at, &candidate.published_at, "published_at", &mut changed);
        refresh(&mut self.archived, &candidate.archived, "archived", &mut changed);
        changed
    }
}

/// Vacancy type from the source (`open`, `closed`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TypeVacancy {
    pub id: String,
    pub name: Option<String>,
}

impl Entity for TypeVacancy {
    type Key = String;

    const KIND: EntityKind = EntityKind::TypeVacancy;
    const MUTABLE_FIELDS: &'static [&'static str] = &["name"];

    fn key(&self) -> &String {
        &self.id
    }

    fn merge_from(&mut self, candidate: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        refresh(&mut self.name, &candidate.name, "name", &mut changed);
        changed
    }
}

/// Employment kind from the source (`full`, `part`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Employment {
    pub id: String,
    pub name: Option<String>,
}

impl Entity for Employment {
    type Key = String;

    const KIND: EntityKind = EntityKind::Employment;
    const MUTABLE_FIELDS: &'static [&'static str] = &["name"];

    fn key(&self) -> &String {
        &self.id
    }

    fn merge_from(&mut self, candidate: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        refresh(&mut self.name, &candidate.name, "name", &mut changed);
        changed
    }
}

/// Salary range; `id` is the owning vacancy id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Salary {
    pub id: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub gross: Option<bool>,
    pub currency: Option<String>,
}

impl Entity for Salary {
    type Key = String;

    const KIND: EntityKind = EntityKind::Salary;
    const MUTABLE_FIELDS: &'static [&'static str] = &["from", "to", "gross", "currency"];

    fn key(&self) -> &String {
        &self.id
    }

    fn merge_from(&mut self, candidate: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        refresh(&mut self.from, &candidate.from, "from", &mut changed);
        refresh(&mut self.to, &candidate.to, "to", &mut changed);
        refresh(&mut self.gross, &candidate.gross, "gross", &mut changed);
        refresh(&mut self.currency, &candidate.currency, "currency", &mut changed);
        changed
    }
}

/// Work address; `id` is the owning vacancy id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    pub id: String,
    pub city: Option<String>,
    pub street: Option<String>,
    pub building: Option<String>,
    pub note: Option<String>,
}

impl Entity for Address {
    type Key = String;

    const KIND: EntityKind = EntityKind::Address;
    const MUTABLE_FIELDS: &'static [&'static str] = &["city", "street", "building", "note"];

    fn key(&self) -> &String {
        &self.id
    }

    fn merge_from(&mut self, candidate: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        refresh(&mut self.city, &candidate.city, "city", &mut changed);
        refresh(&mut self.street, &candidate.street, "street", &mut changed);
        refresh(&mut self.building, &candidate.building, "building", &mut changed);
        refresh(&mut self.note, &candidate.note, "note", &mut changed);
        changed
    }
}

/// Contact person; `id` is the owning vacancy id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Contacts {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Entity for Contacts {
    type Key = String;

    const KIND: EntityKind = EntityKind::Contacts;
    const MUTABLE_FIELDS: &'static [&'static str] = &["name", "email"];

    fn key(&self) -> &String {
        &self.id
    }

    fn merge_from(&mut self, candidate: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        refresh(&mut self.name, &candidate.name, "name", &mut changed);
        refresh(&mut self.email, &candidate.email, "email", &mut changed);
        changed
    }
}

/// Contact phone with a surrogate id.
///
/// Existence is decided by the (country, city) pair across every stored
/// phone, ignoring the number and the owning contacts. This is broad enough
/// to fold distinct numbers of one city into a single record and is kept
/// pending a product decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Phone {
    pub id: Uuid,
    pub country: Option<String>,
    pub city: Option<String>,
    pub number: Option<String>,
    pub note: Option<String>,
    pub contacts_id: String,
}

impl Entity for Phone {
    type Key = Uuid;

    const KIND: EntityKind = EntityKind::Phone;
    const IDENTITY: IdentityRule = IdentityRule::PhoneCodes;
    const MUTABLE_FIELDS: &'static [&'static str] = &["country", "city", "number", "note"];

    fn key(&self) -> &Uuid {
        &self.id
    }

    fn merge_from(&mut self, candidate: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        refresh(&mut self.country, &candidate.country, "country", &mut changed);
        refresh(&mut self.city, &candidate.city, "city", &mut changed);
        refresh(&mut self.number, &candidate.number, "number", &mut changed);
        refresh(&mut self.note, &candidate.note, "note", &mut changed);
        changed
    }

    fn missing_identity(&self) -> Option<&'static str> {
        self.contacts_id.is_blank().then_some("contacts_id")
    }

    fn same_identity(&self, candidate: &Self) -> bool {
        self.country == candidate.country && self.city == candidate.city
    }

    fn prepare_insert(&mut self) {
        if self.id.is_nil() {
            self.id = Uuid::new_v4();
        }
    }
}

/// `{id, name}` reference objects (vacancy type, employment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RefRecord {
    #[serde(deserialize_with = "de::string")]
    pub id: String,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SalaryRecord {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub to: Option<String>,
    #[serde(default, deserialize_with = "de::opt_bool")]
    pub gross: Option<bool>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AddressRecord {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub street: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub building: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhoneRecord {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContactsRecord {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "de::vec_or_null")]
    pub phones: Vec<PhoneRecord>,
}

/// One decoded vacancy with its embedded nested objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VacancyRecord {
    #[serde(deserialize_with = "de::string")]
    pub id: String,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub published_at: Option<String>,
    #[serde(default, deserialize_with = "de::flag")]
    pub archived: bool,
    #[serde(default, rename = "type")]
    pub vacancy_type: Option<RefRecord>,
    #[serde(default)]
    pub employment: Option<RefRecord>,
    #[serde(default)]
    pub salary: Option<SalaryRecord>,
    #[serde(default)]
    pub address: Option<AddressRecord>,
    #[serde(default)]
    pub contacts: Option<ContactsRecord>,
}

impl VacancyRecord {
    pub fn type_vacancy(&self) -> Option<TypeVacancy> {
        self.vacancy_type.as_ref().map(|r| TypeVacancy {
            id: r.id.clone(),
            name: r.name.clone(),
        })
    }

    pub fn employment(&self) -> Option<Employment> {
        self.employment.as_ref().map(|r| Employment {
            id: r.id.clone(),
            name: r.name.clone(),
        })
    }

    /// The anchor entity; foreign keys come from the nested type/employment.
    pub fn vacancy(&self) -> Vacancy {
        Vacancy {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            published_at: self.published_at.clone(),
            archived: self.archived,
            type_id: self.vacancy_type.as_ref().map(|r| r.id.clone()),
            employment_id: self.employment.as_ref().map(|r| r.id.clone()),
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.address.as_ref().map(|a| Address {
            id: self.id.clone(),
            city: a.city.clone(),
            street: a.street.clone(),
            building: a.building.clone(),
            note: a.description.clone(),
        })
    }

    pub fn salary(&self) -> Option<Salary> {
        self.salary.as_ref().map(|s| Salary {
            id: self.id.clone(),
            from: s.from.clone(),
            to: s.to.clone(),
            gross: s.gross,
            currency: s.currency.clone(),
        })
    }

    pub fn contacts(&self) -> Option<Contacts> {
        self.contacts.as_ref().map(|c| Contacts {
            id: self.id.clone(),
            name: c.name.clone(),
            email: c.email.clone(),
        })
    }

    /// Phone candidates owned by this vacancy's contacts (surrogate ids unset).
    pub fn phones(&self) -> Vec<Phone> {
        self.contacts
            .iter()
            .flat_map(|c| c.phones.iter())
            .map(|p| Phone {
                id: Uuid::nil(),
                country: p.country.clone(),
                city: p.city.clone(),
                number: p.number.clone(),
                note: p.comment.clone(),
                contacts_id: self.id.clone(),
            })
            .collect()
    }

    /// Unpersisted view of the whole record.
    pub fn to_graph(&self) -> VacancyGraph {
        VacancyGraph {
            vacancy: self.vacancy(),
            type_vacancy: self.type_vacancy(),
            employment: self.employment(),
            salary: self.salary(),
            address: self.address(),
            contacts: self.contacts(),
            phones: self.phones(),
        }
    }
}

/// One page of the external listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListingPage {
    #[serde(default, deserialize_with = "de::vec_or_null")]
    pub items: Vec<VacancyRecord>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub found: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub pages: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub page: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub per_page: Option<u64>,
}

/// A stored vacancy joined with everything it owns or references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VacancyGraph {
    pub vacancy: Vacancy,
    pub type_vacancy: Option<TypeVacancy>,
    pub employment: Option<Employment>,
    pub salary: Option<Salary>,
    pub address: Option<Address>,
    pub contacts: Option<Contacts>,
    pub phones: Vec<Phone>,
}

/// Read-side paging request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub offset: u64,
    pub size: u64,
    pub name_filter: Option<String>,
}

impl PageQuery {
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size: size.max(1),
            name_filter: None,
        }
    }

    pub fn with_name_filter(mut self, name: impl Into<String>) -> Self {
        self.name_filter = Some(name.into());
        self
    }

    /// Trimmed, non-empty filter text.
    pub fn normalized_filter(&self) -> Option<String> {
        self.name_filter
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }

    /// Case-insensitive equality against the trimmed filter.
    pub fn matches_name(&self, name: Option<&str>) -> bool {
        match self.normalized_filter() {
            None => true,
            Some(filter) => name.is_some_and(|n| n.to_lowercase() == filter.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VacancyPage {
    pub items: Vec<VacancyGraph>,
    pub found: u64,
    pub pages: u64,
    pub page: u64,
    pub per_page: u64,
}

impl VacancyPage {
    pub fn from_listing(listing: &ListingPage) -> Self {
        let per_page = listing.per_page.unwrap_or(listing.items.len() as u64);
        Self {
            items: listing.items.iter().map(VacancyRecord::to_graph).collect(),
            found: listing.found.unwrap_or(listing.items.len() as u64),
            pages: listing.pages.unwrap_or(1),
            page: listing.page.unwrap_or(0),
            per_page,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Created,
    /// The key was already stored; mutable fields were refreshed.
    Updated,
    Deleted,
    NotFoundOnUpdate,
    NotFoundOnDelete,
}

impl OutcomeKind {
    pub fn is_error(&self) -> bool {
        matches!(self, OutcomeKind::NotFoundOnUpdate | OutcomeKind::NotFoundOnDelete)
    }
}

/// Result of one entity-level write decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub entity: EntityKind,
    pub key: String,
    pub kind: OutcomeKind,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    pub note: Option<String>,
}

impl Outcome {
    pub const REFRESHED_NOTE: &'static str = "key already present, fields refreshed";

    pub fn created(entity: EntityKind, key: impl Display) -> Self {
        Self {
            entity,
            key: key.to_string(),
            kind: OutcomeKind::Created,
            changed_fields: Vec::new(),
            note: None,
        }
    }

    pub fn updated(entity: EntityKind, key: impl Display, changed: &[&'static str]) -> Self {
        Self {
            entity,
            key: key.to_string(),
            kind: OutcomeKind::Updated,
            changed_fields: changed.iter().map(|f| f.to_string()).collect(),
            note: Some(Self::REFRESHED_NOTE.to_string()),
        }
    }

    pub fn deleted(entity: EntityKind, key: impl Display) -> Self {
        Self {
            entity,
            key: key.to_string(),
            kind: OutcomeKind::Deleted,
            changed_fields: Vec::new(),
            note: None,
        }
    }

    pub fn not_found_on_update(entity: EntityKind, key: impl Display) -> Self {
        Self {
            entity,
            key: key.to_string(),
            kind: OutcomeKind::NotFoundOnUpdate,
            changed_fields: Vec::new(),
            note: Some("no stored record with this key to update".to_string()),
        }
    }

    pub fn not_found_on_delete(entity: EntityKind, key: impl Display) -> Self {
        Self {
            entity,
            key: key.to_string(),
            kind: OutcomeKind::NotFoundOnDelete,
            changed_fields: Vec::new(),
            note: Some("no stored record with this key to delete".to_string()),
        }
    }
}

/// A vacancy whose reconciliation was abandoned before commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub vacancy_id: String,
    pub reason: String,
}

/// Aggregated per-entity outcomes of one reconciliation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<Outcome>,
    /// Vacancy ids whose unit of work was committed, in commit order.
    pub committed: Vec<String>,
    pub failures: Vec<RecordFailure>,
}

impl Default for BatchOutcome {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            outcomes: Vec::new(),
            committed: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl BatchOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outcome: Outcome) {
        self.outcomes.push(outcome);
    }

    /// Fold another batch into this one, keeping the earliest start.
    pub fn merge(&mut self, other: BatchOutcome) {
        self.started_at = self.started_at.min(other.started_at);
        self.finished_at = self.finished_at.max(other.finished_at);
        self.outcomes.extend(other.outcomes);
        self.committed.extend(other.committed);
        self.failures.extend(other.failures);
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Outcome> {
        self.outcomes.iter()
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes.iter().filter(|o| o.kind == kind).count()
    }

    pub fn for_entity(&self, entity: EntityKind) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(move |o| o.entity == entity)
    }

    pub fn find(&self, entity: EntityKind, key: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.entity == entity && o.key == key)
    }

    /// Outcomes that report a real per-entity error.
    pub fn errors(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.kind.is_error())
    }

    /// No per-entity errors and no abandoned records.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.errors().next().is_none()
    }
}

impl<'a> IntoIterator for &'a BatchOutcome {
    type Item = &'a Outcome;
    type IntoIter = std::slice::Iter<'a, Outcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.iter()
    }
}

impl IntoIterator for BatchOutcome {
    type Item = Outcome;
    type IntoIter = std::vec::IntoIter<Outcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

impl Extend<Outcome> for BatchOutcome {
    fn extend<I: IntoIterator<Item = Outcome>>(&mut self, iter: I) {
        self.outcomes.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> VacancyRecord {
        serde_json::from_str(
            r#"{
                "id": "123",
                "name": "Engineer",
                "archived": false,
                "type": {"id": "open", "name": "Открытая"},
                "employment": {"id": "full", "name": "Полная"},
                "salary": {"from": 1000, "to": "2000", "gross": true, "currency": "RUR"},
                "address": null,
                "contacts": {
                    "name": "Ivan",
                    "email": "hr@example.com",
                    "phones": [{"country": "7", "city": "495", "number": "1234567", "comment": null}]
                }
            }"#,
        )
        .expect("sample record")
    }

    #[test]
    fn record_maps_nested_objects_onto_shared_keys() {
        let record = sample_record();
        let vacancy = record.vacancy();
        assert_eq!(vacancy.type_id.as_deref(), Some("open"));
        assert_eq!(vacancy.employment_id.as_deref(), Some("full"));
        assert_eq!(record.salary().expect("salary mapped").id, "123");
        assert_eq!(record.contacts().expect("contacts mapped").id, "123");
        assert!(record.address().is_none());

        let phones = record.phones();
        assert_eq!(phones.len(), 1);
        assert_eq!(phones[0].contacts_id, "123");
        assert!(phones[0].id.is_nil());
    }

    #[test]
    fn salary_amounts_keep_source_text() {
        let salary = sample_record().salary().expect("salary mapped");
        assert_eq!(salary.from.as_deref(), Some("1000"));
        assert_eq!(salary.to.as_deref(), Some("2000"));
        assert_eq!(salary.gross, Some(true));
    }

    #[test]
    fn merge_reports_only_changed_fields_and_keeps_key() {
        let mut stored = Salary {
            id: "123".into(),
            from: Some("1000".into()),
            to: Some("2000".into()),
            gross: None,
            currency: Some("RUR".into()),
        };
        let candidate = Salary {
            id: "other".into(),
            to: Some("2500".into()),
            ..stored.clone()
        };

        let changed = stored.merge_from(&candidate);
        assert_eq!(changed, vec!["to"]);
        assert_eq!(stored.id, "123");
        assert_eq!(stored.to.as_deref(), Some("2500"));
    }

    #[test]
    fn vacancy_merge_keeps_relationship_keys() {
        let mut stored = sample_record().vacancy();
        let candidate = Vacancy {
            id: "123".into(),
            name: Some("Senior Engineer".into()),
            type_id: None,
            employment_id: Some("part".into()),
            ..stored.clone()
        };

        let changed = stored.merge_from(&candidate);
        assert_eq!(changed, vec!["name"]);
        assert_eq!(stored.type_id.as_deref(), Some("open"));
        assert_eq!(stored.employment_id.as_deref(), Some("full"));
    }

    #[test]
    fn phone_identity_ignores_number_and_owner() {
        let stored = Phone {
            id: Uuid::new_v4(),
            country: Some("7".into()),
            city: Some("495".into()),
            number: Some("1111111".into()),
            note: None,
            contacts_id: "1".into(),
        };
        let candidate = Phone {
            id: Uuid::nil(),
            number: Some("2222222".into()),
            contacts_id: "2".into(),
            ..stored.clone()
        };
        assert!(stored.same_identity(&candidate));

        let mut merged = stored.clone();
        let changed = merged.merge_from(&candidate);
        assert_eq!(changed, vec!["number"]);
        assert_eq!(merged.contacts_id, "1");
        assert_eq!(merged.id, stored.id);
    }

    #[test]
    fn phone_insert_assigns_surrogate_once() {
        let mut phone = Phone {
            contacts_id: "1".into(),
            ..Phone::default()
        };
        assert_eq!(phone.missing_identity(), None);
        phone.prepare_insert();
        let first = phone.id;
        assert!(!first.is_nil());
        phone.prepare_insert();
        assert_eq!(phone.id, first);
    }

    #[test]
    fn blank_natural_key_is_missing_identity() {
        let vacancy = Vacancy {
            id: "  ".into(),
            ..Vacancy::default()
        };
        assert_eq!(vacancy.missing_identity(), Some("id"));
        assert_eq!(Phone::default().missing_identity(), Some("contacts_id"));
    }

    #[test]
    fn published_at_accepts_source_offset_format() {
        let vacancy = Vacancy {
            id: "1".into(),
            published_at: Some("2024-03-01T10:00:00+0300".into()),
            ..Vacancy::default()
        };
        let parsed = vacancy.published_at_parsed().expect("parse published_at");
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T10:00:00+03:00");
    }

    #[test]
    fn page_query_name_match_is_trimmed_and_case_insensitive() {
        let query = PageQuery::new(0, 10).with_name_filter("  engineer ");
        assert!(query.matches_name(Some("Engineer")));
        assert!(!query.matches_name(Some("Senior Engineer")));
        assert!(!query.matches_name(None));
        assert!(PageQuery::new(0, 10).matches_name(None));
    }

    #[test]
    fn batch_outcome_counts_and_merges() {
        let mut batch = BatchOutcome::new();
        batch.push(Outcome::created(EntityKind::Vacancy, "1"));
        let mut other = BatchOutcome::new();
        other.push(Outcome::updated(EntityKind::Salary, "1", &["to"]));
        other.push(Outcome::not_found_on_update(EntityKind::Address, "9"));
        batch.merge(other);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.count(OutcomeKind::Created), 1);
        assert_eq!(batch.errors().count(), 1);
        assert!(!batch.is_clean());
        let salary = batch.find(EntityKind::Salary, "1").expect("salary outcome");
        assert_eq!(salary.note.as_deref(), Some(Outcome::REFRESHED_NOTE));
        assert_eq!(salary.changed_fields, vec!["to".to_string()]);
    }
}

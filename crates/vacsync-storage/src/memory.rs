//! In-process store with the same unit-of-work semantics as the database one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use vacsync_core::{
    Address, Contacts, Employment, EntityKind, IdentityRule, PageQuery, Phone, Salary,
    TypeVacancy, Vacancy, VacancyGraph, VacancyPage,
};

use crate::{
    page_numbers, ChangeSet, CommitSummary, EntitySet, Pending, StorageError, Store,
    StoredEntity, UnitOfWork,
};

#[derive(Debug, Default)]
struct Tables {
    type_vacancies: BTreeMap<String, TypeVacancy>,
    employments: BTreeMap<String, Employment>,
    vacancies: BTreeMap<String, Vacancy>,
    addresses: BTreeMap<String, Address>,
    salaries: BTreeMap<String, Salary>,
    contacts: BTreeMap<String, Contacts>,
    phones: BTreeMap<Uuid, Phone>,
}

trait MemoryEntity: StoredEntity {
    fn table(tables: &Tables) -> &BTreeMap<Self::Key, Self>;
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self>;
}

macro_rules! memory_entity {
    ($($ty:ty => $field:ident),+ $(,)?) => {
        $(
            impl MemoryEntity for $ty {
                fn table(tables: &Tables) -> &BTreeMap<Self::Key, Self> {
                    &tables.$field
                }

                fn table_mut(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self> {
                    &mut tables.$field
                }
            }
        )+
    };
}

memory_entity!(
    TypeVacancy => type_vacancies,
    Employment => employments,
    Vacancy => vacancies,
    Address => addresses,
    Salary => salaries,
    Contacts => contacts,
    Phone => phones,
);

/// Injected lookup failure, matched on kind and optionally on key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fault {
    kind: EntityKind,
    key: Option<String>,
}

/// Store backed by process memory; used by tests and `--memory` runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make lookups of `kind` fail with [`StorageError::Unavailable`];
    /// `key` narrows the failure to one identity key.
    pub async fn fail_lookups(&self, kind: EntityKind, key: Option<&str>) {
        self.faults.lock().await.push(Fault {
            kind,
            key: key.map(ToString::to_string),
        });
    }

    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    /// Committed row count for one kind.
    pub async fn count(&self, kind: EntityKind) -> usize {
        let tables = self.tables.lock().await;
        match kind {
            EntityKind::TypeVacancy => tables.type_vacancies.len(),
            EntityKind::Employment => tables.employments.len(),
            EntityKind::Vacancy => tables.vacancies.len(),
            EntityKind::Address => tables.addresses.len(),
            EntityKind::Salary => tables.salaries.len(),
            EntityKind::Contacts => tables.contacts.len(),
            EntityKind::Phone => tables.phones.len(),
        }
    }

    pub async fn phones(&self) -> Vec<Phone> {
        self.tables.lock().await.phones.values().cloned().collect()
    }

    pub async fn type_vacancy(&self, id: &str) -> Option<TypeVacancy> {
        self.tables.lock().await.type_vacancies.get(id).cloned()
    }

    pub async fn employment(&self, id: &str) -> Option<Employment> {
        self.tables.lock().await.employments.get(id).cloned()
    }
}

fn graph_for(tables: &Tables, vacancy: &Vacancy) -> VacancyGraph {
    let mut phones = tables
        .phones
        .values()
        .filter(|p| p.contacts_id == vacancy.id)
        .cloned()
        .collect::<Vec<_>>();
    phones.sort_by(|a, b| a.id.cmp(&b.id));

    VacancyGraph {
        vacancy: vacancy.clone(),
        type_vacancy: vacancy
            .type_id
            .as_ref()
            .and_then(|id| tables.type_vacancies.get(id))
            .cloned(),
        employment: vacancy
            .employment_id
            .as_ref()
            .and_then(|id| tables.employments.get(id))
            .cloned(),
        salary: tables.salaries.get(&vacancy.id).cloned(),
        address: tables.addresses.get(&vacancy.id).cloned(),
        contacts: tables.contacts.get(&vacancy.id).cloned(),
        phones,
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Unit = MemoryUnit;

    async fn begin(&self) -> Result<MemoryUnit, StorageError> {
        Ok(MemoryUnit {
            tables: Arc::clone(&self.tables),
            faults: Arc::clone(&self.faults),
            changes: ChangeSet::default(),
        })
    }

    async fn find_vacancy(&self, id: &str) -> Result<Option<VacancyGraph>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables.vacancies.get(id).map(|v| graph_for(&tables, v)))
    }

    async fn list_vacancies(&self, query: &PageQuery) -> Result<VacancyPage, StorageError> {
        let tables = self.tables.lock().await;
        let matching = tables
            .vacancies
            .values()
            .rev()
            .filter(|v| query.matches_name(v.name.as_deref()))
            .collect::<Vec<_>>();
        let found = matching.len() as u64;
        let (pages, page) = page_numbers(found, query);
        let items = matching
            .into_iter()
            .skip(usize::try_from(query.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(query.size).unwrap_or(usize::MAX))
            .map(|v| graph_for(&tables, v))
            .collect();

        Ok(VacancyPage {
            items,
            found,
            pages,
            page,
            per_page: query.size,
        })
    }
}

/// Unit of work over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryUnit {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<Vec<Fault>>>,
    changes: ChangeSet,
}

impl MemoryUnit {
    async fn check_fault(&self, kind: EntityKind, key: &str) -> Result<(), StorageError> {
        let faults = self.faults.lock().await;
        let hit = faults
            .iter()
            .any(|f| f.kind == kind && f.key.as_deref().map_or(true, |k| k == key));
        if hit {
            return Err(StorageError::Unavailable {
                kind,
                reason: format!("injected lookup failure for key {key:?}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<E: MemoryEntity> EntitySet<E> for MemoryUnit {
    async fn find_by_key(&mut self, key: &E::Key) -> Result<Option<E>, StorageError> {
        self.check_fault(E::KIND, &key.to_string()).await?;
        if let Some(pending) = E::pending(&self.changes).get(key) {
            return Ok(pending.cloned());
        }
        let tables = self.tables.lock().await;
        Ok(E::table(&tables).get(key).cloned())
    }

    async fn find_same(&mut self, candidate: &E) -> Result<Option<E>, StorageError> {
        match E::IDENTITY {
            IdentityRule::NaturalKey => EntitySet::<E>::find_by_key(self, candidate.key()).await,
            IdentityRule::PhoneCodes => {
                self.check_fault(E::KIND, &candidate.key().to_string()).await?;
                let pending = E::pending(&self.changes);
                if let Some(hit) = pending.find_same(candidate) {
                    return Ok(Some(hit.clone()));
                }
                let tables = self.tables.lock().await;
                Ok(E::table(&tables)
                    .values()
                    .filter(|stored| pending.get(stored.key()).is_none())
                    .find(|stored| stored.same_identity(candidate))
                    .cloned())
            }
        }
    }

    fn add(&mut self, entity: E) {
        E::pending_mut(&mut self.changes).add(entity);
    }

    fn mark_modified(&mut self, entity: E) {
        E::pending_mut(&mut self.changes).modify(entity);
    }

    fn remove(&mut self, key: E::Key) {
        E::pending_mut(&mut self.changes).remove(key);
    }
}

fn check_table<E: MemoryEntity>(tables: &Tables, changes: &ChangeSet) -> Result<(), StorageError> {
    let table = E::table(tables);
    for (key, pending) in E::pending(changes).iter() {
        let clash = match pending {
            Pending::Added(_) => table.contains_key(key),
            Pending::Modified(_) => !table.contains_key(key),
            Pending::Removed => false,
        };
        if clash {
            return Err(StorageError::Conflict {
                kind: E::KIND,
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

fn apply_table<E: MemoryEntity>(tables: &mut Tables, changes: &ChangeSet, summary: &mut CommitSummary) {
    let table = E::table_mut(tables);
    for (key, pending) in E::pending(changes).iter() {
        match pending {
            Pending::Added(entity) => {
                table.insert(key.clone(), entity.clone());
                summary.inserted += 1;
            }
            Pending::Modified(entity) => {
                table.insert(key.clone(), entity.clone());
                summary.updated += 1;
            }
            Pending::Removed => {
                if table.remove(key).is_some() {
                    summary.removed += 1;
                }
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn commit(self) -> Result<CommitSummary, StorageError> {
        let mut tables = self.tables.lock().await;

        // Validate everything first so a conflict leaves the tables untouched.
        check_table::<TypeVacancy>(&tables, &self.changes)?;
        check_table::<Employment>(&tables, &self.changes)?;
        check_table::<Vacancy>(&tables, &self.changes)?;
        check_table::<Address>(&tables, &self.changes)?;
        check_table::<Salary>(&tables, &self.changes)?;
        check_table::<Contacts>(&tables, &self.changes)?;
        check_table::<Phone>(&tables, &self.changes)?;

        let mut summary = CommitSummary::default();
        apply_table::<TypeVacancy>(&mut tables, &self.changes, &mut summary);
        apply_table::<Employment>(&mut tables, &self.changes, &mut summary);
        apply_table::<Vacancy>(&mut tables, &self.changes, &mut summary);
        apply_table::<Address>(&mut tables, &self.changes, &mut summary);
        apply_table::<Salary>(&mut tables, &self.changes, &mut summary);
        apply_table::<Contacts>(&mut tables, &self.changes, &mut summary);
        apply_table::<Phone>(&mut tables, &self.changes, &mut summary);

        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            removed = summary.removed,
            "memory unit committed"
        );
        Ok(summary)
    }
}

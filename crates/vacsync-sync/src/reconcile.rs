//! Reconciliation of decoded vacancy graphs into a [`Store`].

use tracing::{info, instrument, warn};
use vacsync_core::{BatchOutcome, RecordFailure, VacancyRecord};
use vacsync_storage::{Store, UnitOfWork};

use crate::engine::upsert;
use crate::SyncError;

/// Upsert one vacancy graph and commit it as a single unit.
///
/// Order is type, employment, vacancy, address, salary, contacts, phones.
/// Any error drops the unit before commit, so nothing of this record is
/// written.
#[instrument(skip_all, fields(vacancy_id = %record.id))]
pub async fn reconcile_one<S>(store: &S, record: &VacancyRecord) -> Result<BatchOutcome, SyncError>
where
    S: Store + ?Sized,
{
    let mut batch = BatchOutcome::new();
    let mut unit = store.begin().await?;

    if let Some(type_vacancy) = record.type_vacancy() {
        batch.push(upsert(&mut unit, type_vacancy).await?);
    }
    if let Some(employment) = record.employment() {
        batch.push(upsert(&mut unit, employment).await?);
    }
    batch.push(upsert(&mut unit, record.vacancy()).await?);
    if let Some(address) = record.address() {
        batch.push(upsert(&mut unit, address).await?);
    }
    if let Some(salary) = record.salary() {
        batch.push(upsert(&mut unit, salary).await?);
    }
    if let Some(contacts) = record.contacts() {
        batch.push(upsert(&mut unit, contacts).await?);
        for phone in record.phones() {
            batch.push(upsert(&mut unit, phone).await?);
        }
    }

    let summary = unit.commit().await?;
    batch.committed.push(record.id.clone());
    batch.finish();
    info!(
        inserted = summary.inserted,
        updated = summary.updated,
        outcomes = batch.len(),
        "vacancy committed"
    );
    Ok(batch)
}

/// Reconcile records one after another, each in its own unit.
///
/// A record that fails is listed in `failures`; records before it stay
/// committed and records after it are still attempted.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn reconcile_many<S>(store: &S, records: &[VacancyRecord]) -> BatchOutcome
where
    S: Store + ?Sized,
{
    let mut batch = BatchOutcome::new();
    for record in records {
        match reconcile_one(store, record).await {
            Ok(outcome) => batch.merge(outcome),
            Err(err) => {
                warn!(vacancy_id = %record.id, error = %err, "vacancy not reconciled");
                batch.failures.push(RecordFailure {
                    vacancy_id: record.id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    batch.finish();
    info!(
        committed = batch.committed.len(),
        failed = batch.failures.len(),
        "page reconciled"
    );
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use vacsync_core::{EntityKind, OutcomeKind, RefRecord};
    use vacsync_storage::MemoryStore;

    fn record(id: &str) -> VacancyRecord {
        VacancyRecord {
            id: id.to_string(),
            name: Some("Engineer".into()),
            vacancy_type: Some(RefRecord {
                id: "open".into(),
                name: Some("Открытая".into()),
            }),
            ..VacancyRecord::default()
        }
    }

    #[tokio::test]
    async fn outcomes_follow_dependency_order() {
        let store = MemoryStore::new();
        let batch = reconcile_one(&store, &record("1")).await.expect("reconcile vacancy");
        let kinds = batch.iter().map(|o| o.entity).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EntityKind::TypeVacancy, EntityKind::Vacancy]);
        assert_eq!(batch.committed, vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn blank_vacancy_id_commits_nothing() {
        let store = MemoryStore::new();
        let err = reconcile_one(&store, &record("  "))
            .await
            .expect_err("blank id must be rejected");
        assert!(matches!(err, SyncError::InvalidArgument { .. }));
        assert_eq!(store.count(EntityKind::TypeVacancy).await, 0);
    }

    #[tokio::test]
    async fn shared_type_is_created_once_across_records() {
        let store = MemoryStore::new();
        let batch = reconcile_many(&store, &[record("1"), record("2")]).await;
        let types = batch
            .for_entity(EntityKind::TypeVacancy)
            .map(|o| o.kind)
            .collect::<Vec<_>>();
        assert_eq!(types, vec![OutcomeKind::Created, OutcomeKind::Updated]);
        assert_eq!(store.count(EntityKind::TypeVacancy).await, 1);
        assert!(batch.is_clean());
    }
}

//! Create-or-update over any entity kind.
//!
//! Every function works on one [`EntitySet`] and only stages changes; the
//! caller's unit of work decides when they reach storage.

use tracing::debug;
use vacsync_core::{BatchOutcome, Entity, EntityKey, Outcome};
use vacsync_storage::EntitySet;

use crate::SyncError;

fn require_identity<E: Entity>(candidate: &E) -> Result<(), SyncError> {
    match candidate.missing_identity() {
        Some(field) => Err(SyncError::InvalidArgument {
            kind: E::KIND,
            reason: format!("{field} is empty"),
        }),
        None => Ok(()),
    }
}

pub async fn exists<E, S>(set: &mut S, key: &E::Key) -> Result<bool, SyncError>
where
    E: Entity,
    S: EntitySet<E> + ?Sized,
{
    Ok(set.find_by_key(key).await?.is_some())
}

/// Refresh the stored instance with the same identity, or stage a new one.
///
/// A present key is the common case and yields an `Updated` outcome, never
/// an error. Phones match on country and city codes (see
/// [`vacsync_core::IdentityRule::PhoneCodes`]), so a differing number
/// overwrites the matched record instead of adding a second one.
pub async fn upsert<E, S>(set: &mut S, mut candidate: E) -> Result<Outcome, SyncError>
where
    E: Entity,
    S: EntitySet<E> + ?Sized,
{
    require_identity(&candidate)?;

    let outcome = match set.find_same(&candidate).await? {
        Some(mut stored) => {
            let changed = stored.merge_from(&candidate);
            let outcome = Outcome::updated(E::KIND, stored.key(), &changed);
            set.mark_modified(stored);
            outcome
        }
        None => {
            candidate.prepare_insert();
            let outcome = Outcome::created(E::KIND, candidate.key());
            set.add(candidate);
            outcome
        }
    };

    debug!(
        entity = %outcome.entity,
        key = %outcome.key,
        kind = ?outcome.kind,
        changed = ?outcome.changed_fields,
        "upsert staged"
    );
    Ok(outcome)
}

pub async fn upsert_many<E, S, I>(set: &mut S, candidates: I) -> Result<BatchOutcome, SyncError>
where
    E: Entity,
    S: EntitySet<E> + ?Sized,
    I: IntoIterator<Item = E>,
{
    let mut batch = BatchOutcome::new();
    for candidate in candidates {
        batch.push(upsert(set, candidate).await?);
    }
    batch.finish();
    Ok(batch)
}

/// Overwrite mutable fields of an existing key; a missing key is reported
/// as `NotFoundOnUpdate` rather than created.
pub async fn update<E, S>(set: &mut S, candidate: E) -> Result<Outcome, SyncError>
where
    E: Entity,
    S: EntitySet<E> + ?Sized,
{
    require_identity(&candidate)?;

    match set.find_by_key(candidate.key()).await? {
        Some(mut stored) => {
            let changed = stored.merge_from(&candidate);
            let outcome = Outcome::updated(E::KIND, stored.key(), &changed);
            set.mark_modified(stored);
            Ok(outcome)
        }
        None => {
            debug!(entity = %E::KIND, key = %candidate.key(), "update of unknown key");
            Ok(Outcome::not_found_on_update(E::KIND, candidate.key()))
        }
    }
}

pub async fn delete<E, S>(set: &mut S, key: E::Key) -> Result<Outcome, SyncError>
where
    E: Entity,
    S: EntitySet<E> + ?Sized,
{
    if key.is_blank() {
        return Err(SyncError::InvalidArgument {
            kind: E::KIND,
            reason: "key is empty".to_string(),
        });
    }
    if !exists::<E, S>(set, &key).await? {
        return Ok(Outcome::not_found_on_delete(E::KIND, &key));
    }
    let outcome = Outcome::deleted(E::KIND, &key);
    set.remove(key);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vacsync_core::{EntityKind, OutcomeKind, Phone, Salary, Vacancy};
    use vacsync_storage::{MemoryStore, Store, UnitOfWork};

    fn salary(to: &str) -> Salary {
        Salary {
            id: "123".into(),
            from: Some("1000".into()),
            to: Some(to.into()),
            gross: None,
            currency: Some("RUR".into()),
        }
    }

    fn phone(city: &str, number: &str) -> Phone {
        Phone {
            id: Uuid::nil(),
            country: Some("7".into()),
            city: Some(city.into()),
            number: Some(number.into()),
            note: None,
            contacts_id: "123".into(),
        }
    }

    #[tokio::test]
    async fn second_upsert_of_same_key_is_an_update() {
        let store = MemoryStore::new();
        let mut unit = store.begin().await.expect("begin unit");

        let first = upsert(&mut unit, salary("2000")).await.expect("stage upsert");
        assert_eq!(first.kind, OutcomeKind::Created);

        let second = upsert(&mut unit, salary("2500")).await.expect("stage upsert");
        assert_eq!(second.kind, OutcomeKind::Updated);
        assert_eq!(second.changed_fields, vec!["to".to_string()]);
        assert_eq!(second.note.as_deref(), Some(Outcome::REFRESHED_NOTE));
        assert_eq!(second.key, "123");
    }

    #[tokio::test]
    async fn blank_key_is_invalid_argument() {
        let store = MemoryStore::new();
        let mut unit = store.begin().await.expect("begin unit");
        let err = upsert(&mut unit, Vacancy::default())
            .await
            .expect_err("blank key must be rejected");
        assert!(matches!(
            err,
            SyncError::InvalidArgument {
                kind: EntityKind::Vacancy,
                ..
            }
        ));

        let orphan = Phone {
            contacts_id: " ".into(),
            ..phone("495", "1")
        };
        assert!(upsert(&mut unit, orphan).await.is_err());
    }

    #[tokio::test]
    async fn phone_with_same_codes_is_overwritten_in_place() {
        let store = MemoryStore::new();
        let mut unit = store.begin().await.expect("begin unit");

        let created = upsert(&mut unit, phone("495", "1111111")).await.expect("stage upsert");
        let updated = upsert(&mut unit, phone("495", "2222222")).await.expect("stage upsert");
        assert_eq!(created.kind, OutcomeKind::Created);
        assert_eq!(updated.kind, OutcomeKind::Updated);
        assert_eq!(created.key, updated.key);
        assert_eq!(updated.changed_fields, vec!["number".to_string()]);

        let other_city = upsert(&mut unit, phone("812", "2222222")).await.expect("stage upsert");
        assert_eq!(other_city.kind, OutcomeKind::Created);
        assert_ne!(other_city.key, created.key);
    }

    #[tokio::test]
    async fn upsert_many_collects_every_outcome() {
        let store = MemoryStore::new();
        let mut unit = store.begin().await.expect("begin unit");
        let batch = upsert_many(&mut unit, vec![salary("1"), salary("2"), salary("2")])
            .await
            .expect("stage upserts");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.count(OutcomeKind::Created), 1);
        assert_eq!(batch.count(OutcomeKind::Updated), 2);
        assert!(batch.is_clean());
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_keys() {
        let store = MemoryStore::new();
        let mut unit = store.begin().await.expect("begin unit");

        let missing = update(&mut unit, salary("2000")).await.expect("stage update");
        assert_eq!(missing.kind, OutcomeKind::NotFoundOnUpdate);
        assert!(missing.kind.is_error());

        let gone = delete::<Salary, _>(&mut unit, "123".to_string()).await.expect("stage delete");
        assert_eq!(gone.kind, OutcomeKind::NotFoundOnDelete);

        upsert(&mut unit, salary("2000")).await.expect("stage upsert");
        unit.commit().await.expect("commit unit");

        let mut unit = store.begin().await.expect("begin unit");
        let refreshed = update(&mut unit, salary("3000")).await.expect("stage update");
        assert_eq!(refreshed.kind, OutcomeKind::Updated);
        let deleted = delete::<Salary, _>(&mut unit, "123".to_string())
            .await
            .expect("stage delete");
        assert_eq!(deleted.kind, OutcomeKind::Deleted);
        unit.commit().await.expect("commit unit");
        assert_eq!(store.count(EntityKind::Salary).await, 0);
    }
}

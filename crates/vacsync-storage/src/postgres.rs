//! Postgres store. Tables follow `sql/schema.sql`.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;
use vacsync_core::{
    Address, Contacts, Employment, IdentityRule, PageQuery, Phone, Salary, TypeVacancy,
    Vacancy, VacancyGraph, VacancyPage,
};

use crate::{
    page_numbers, ChangeSet, CommitSummary, EntitySet, Pending, StorageError, Store,
    StoredEntity, UnitOfWork,
};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

const KEY_COLUMN: &str = "id";

/// Row mapping for one entity kind.
trait PgEntity: StoredEntity {
    const TABLE: &'static str;
    /// Columns written on insert only.
    const EXTRA_COLUMNS: &'static [&'static str] = &[];

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error>;

    fn bind_key<'q>(key: &Self::Key, query: PgQuery<'q>) -> PgQuery<'q>;

    /// Binds `MUTABLE_FIELDS` in declaration order.
    fn bind_mutable<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q>;

    fn bind_extra<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
    }

    /// Predicate used when identity is not the primary key.
    fn same_filter() -> Option<&'static str> {
        None
    }

    fn bind_same<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
    }
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

fn columns<E: PgEntity>() -> Vec<&'static str> {
    std::iter::once(KEY_COLUMN)
        .chain(E::MUTABLE_FIELDS.iter().copied())
        .chain(E::EXTRA_COLUMNS.iter().copied())
        .collect()
}

fn column_list<E: PgEntity>() -> String {
    columns::<E>()
        .into_iter()
        .map(quote)
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_where<E: PgEntity>(predicate: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {predicate}",
        column_list::<E>(),
        E::TABLE
    )
}

fn select_by_key_sql<E: PgEntity>() -> String {
    select_where::<E>(&format!("{} = $1", quote(KEY_COLUMN)))
}

fn insert_sql<E: PgEntity>() -> String {
    let count = columns::<E>().len();
    let placeholders = (1..=count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        E::TABLE,
        column_list::<E>()
    )
}

fn update_sql<E: PgEntity>() -> String {
    let assignments = E::MUTABLE_FIELDS
        .iter()
        .enumerate()
        .map(|(i, field)| format!("{} = ${}", quote(field), i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {assignments} WHERE {} = $1",
        E::TABLE,
        quote(KEY_COLUMN)
    )
}

fn delete_sql<E: PgEntity>() -> String {
    format!("DELETE FROM {} WHERE {} = $1", E::TABLE, quote(KEY_COLUMN))
}

impl PgEntity for TypeVacancy {
    const TABLE: &'static str = "type_vacancies";

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    fn bind_key<'q>(key: &String, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(key.clone())
    }

    fn bind_mutable<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.name.clone())
    }
}

impl PgEntity for Employment {
    const TABLE: &'static str = "employments";

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    fn bind_key<'q>(key: &String, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(key.clone())
    }

    fn bind_mutable<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.name.clone())
    }
}

impl PgEntity for Vacancy {
    const TABLE: &'static str = "vacancies";
    const EXTRA_COLUMNS: &'static [&'static str] = &["type_id", "employment_id"];

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            published_at: row.try_get("published_at")?,
            archived: row.try_get("archived")?,
            type_id: row.try_get("type_id")?,
            employment_id: row.try_get("employment_id")?,
        })
    }

    fn bind_key<'q>(key: &String, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(key.clone())
    }

    fn bind_mutable<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.name.clone())
            .bind(self.description.clone())
            .bind(self.published_at.clone())
            .bind(self.archived)
    }

    fn bind_extra<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.type_id.clone())
            .bind(self.employment_id.clone())
    }
}

impl PgEntity for Address {
    const TABLE: &'static str = "addresses";

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            city: row.try_get("city")?,
            street: row.try_get("street")?,
            building: row.try_get("building")?,
            note: row.try_get("note")?,
        })
    }

    fn bind_key<'q>(key: &String, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(key.clone())
    }

    fn bind_mutable<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.city.clone())
            .bind(self.street.clone())
            .bind(self.building.clone())
            .bind(self.note.clone())
    }
}

impl PgEntity for Salary {
    const TABLE: &'static str = "salaries";

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            from: row.try_get("from")?,
            to: row.try_get("to")?,
            gross: row.try_get("gross")?,
            currency: row.try_get("currency")?,
        })
    }

    fn bind_key<'q>(key: &String, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(key.clone())
    }

    fn bind_mutable<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.from.clone())
            .bind(self.to.clone())
            .bind(self.gross)
            .bind(self.currency.clone())
    }
}

impl PgEntity for Contacts {
    const TABLE: &'static str = "contacts";

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
        })
    }

    fn bind_key<'q>(key: &String, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(key.clone())
    }

    fn bind_mutable<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.name.clone()).bind(self.email.clone())
    }
}

impl PgEntity for Phone {
    const TABLE: &'static str = "phones";
    const EXTRA_COLUMNS: &'static [&'static str] = &["contacts_id"];

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            country: row.try_get("country")?,
            city: row.try_get("city")?,
            number: row.try_get("number")?,
            note: row.try_get("note")?,
            contacts_id: row.try_get("contacts_id")?,
        })
    }

    fn bind_key<'q>(key: &Uuid, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(*key)
    }

    fn bind_mutable<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query
            .bind(self.country.clone())
            .bind(self.city.clone())
            .bind(self.number.clone())
            .bind(self.note.clone())
    }

    fn bind_extra<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.contacts_id.clone())
    }

    fn same_filter() -> Option<&'static str> {
        Some(r#""country" IS NOT DISTINCT FROM $1 AND "city" IS NOT DISTINCT FROM $2"#)
    }

    fn bind_same<'q>(&self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.country.clone()).bind(self.city.clone())
    }
}

async fn fetch_by_key<E: PgEntity>(pool: &PgPool, key: &E::Key) -> Result<Option<E>, StorageError> {
    let sql = select_by_key_sql::<E>();
    let row = E::bind_key(key, sqlx::query(&sql))
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(E::from_row).transpose()?)
}

async fn load_graph(pool: &PgPool, vacancy: Vacancy) -> Result<VacancyGraph, StorageError> {
    let type_vacancy = match &vacancy.type_id {
        Some(id) => fetch_by_key::<TypeVacancy>(pool, id).await?,
        None => None,
    };
    let employment = match &vacancy.employment_id {
        Some(id) => fetch_by_key::<Employment>(pool, id).await?,
        None => None,
    };
    let salary = fetch_by_key::<Salary>(pool, &vacancy.id).await?;
    let address = fetch_by_key::<Address>(pool, &vacancy.id).await?;
    let contacts = fetch_by_key::<Contacts>(pool, &vacancy.id).await?;

    let sql = format!(
        "{} ORDER BY {}",
        select_where::<Phone>(r#""contacts_id" = $1"#),
        quote(KEY_COLUMN)
    );
    let phones = sqlx::query(&sql)
        .bind(vacancy.id.clone())
        .fetch_all(pool)
        .await?
        .iter()
        .map(Phone::from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(VacancyGraph {
        vacancy,
        type_vacancy,
        employment,
        salary,
        address,
        contacts,
        phones,
    })
}

/// Store backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    type Unit = PgUnit;

    async fn begin(&self) -> Result<PgUnit, StorageError> {
        Ok(PgUnit {
            pool: self.pool.clone(),
            changes: ChangeSet::default(),
        })
    }

    async fn find_vacancy(&self, id: &str) -> Result<Option<VacancyGraph>, StorageError> {
        match fetch_by_key::<Vacancy>(&self.pool, &id.to_string()).await? {
            Some(vacancy) => Ok(Some(load_graph(&self.pool, vacancy).await?)),
            None => Ok(None),
        }
    }

    async fn list_vacancies(&self, query: &PageQuery) -> Result<VacancyPage, StorageError> {
        let filter = query.normalized_filter();
        let predicate = if filter.is_some() {
            r#"lower("name") = lower($1)"#
        } else {
            "TRUE"
        };

        let count_sql = format!("SELECT COUNT(*) FROM {} WHERE {predicate}", Vacancy::TABLE);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(name) = &filter {
            count_query = count_query.bind(name.clone());
        }
        let found = u64::try_from(count_query.fetch_one(&self.pool).await?).unwrap_or(0);

        let limit_at = if filter.is_some() { 2 } else { 1 };
        let page_sql = format!(
            "{} ORDER BY {} DESC LIMIT ${} OFFSET ${}",
            select_where::<Vacancy>(predicate),
            quote(KEY_COLUMN),
            limit_at,
            limit_at + 1
        );
        let mut page_query = sqlx::query(&page_sql);
        if let Some(name) = &filter {
            page_query = page_query.bind(name.clone());
        }
        let rows = page_query
            .bind(i64::try_from(query.size).unwrap_or(i64::MAX))
            .bind(i64::try_from(query.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(load_graph(&self.pool, Vacancy::from_row(row)?).await?);
        }
        let (pages, page) = page_numbers(found, query);

        Ok(VacancyPage {
            items,
            found,
            pages,
            page,
            per_page: query.size,
        })
    }
}

/// Unit of work over a [`PgStore`]; nothing reaches the database before commit.
#[derive(Debug)]
pub struct PgUnit {
    pool: PgPool,
    changes: ChangeSet,
}

#[async_trait]
impl<E: PgEntity> EntitySet<E> for PgUnit {
    async fn find_by_key(&mut self, key: &E::Key) -> Result<Option<E>, StorageError> {
        if let Some(pending) = E::pending(&self.changes).get(key) {
            return Ok(pending.cloned());
        }
        fetch_by_key::<E>(&self.pool, key).await
    }

    async fn find_same(&mut self, candidate: &E) -> Result<Option<E>, StorageError> {
        let filter = match (E::IDENTITY, E::same_filter()) {
            (IdentityRule::PhoneCodes, Some(filter)) => filter,
            _ => return EntitySet::<E>::find_by_key(self, candidate.key()).await,
        };

        let pending = E::pending(&self.changes);
        if let Some(hit) = pending.find_same(candidate) {
            return Ok(Some(hit.clone()));
        }

        let sql = format!("{} ORDER BY {}", select_where::<E>(filter), quote(KEY_COLUMN));
        let rows = candidate
            .bind_same(sqlx::query(&sql))
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let stored = E::from_row(row)?;
            if pending.get(stored.key()).is_none() {
                return Ok(Some(stored));
            }
        }
        Ok(None)
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

fn conflict_or_database<E: PgEntity>(err: sqlx::Error, key: &E::Key) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict {
            kind: E::KIND,
            key: key.to_string(),
        },
        _ => StorageError::Database(err),
    }
}

async fn write_rows<E: PgEntity>(
    tx: &mut Transaction<'_, Postgres>,
    changes: &ChangeSet,
    summary: &mut CommitSummary,
) -> Result<(), StorageError> {
    let insert = insert_sql::<E>();
    let update = update_sql::<E>();
    for (key, pending) in E::pending(changes).iter() {
        match pending {
            Pending::Added(entity) => {
                let query = E::bind_key(key, sqlx::query(&insert));
                entity
                    .bind_extra(entity.bind_mutable(query))
                    .execute(&mut **tx)
                    .await
                    .map_err(|err| conflict_or_database::<E>(err, key))?;
                summary.inserted += 1;
            }
            Pending::Modified(entity) => {
                let result = entity
                    .bind_mutable(E::bind_key(key, sqlx::query(&update)))
                    .execute(&mut **tx)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StorageError::Conflict {
                        kind: E::KIND,
                        key: key.to_string(),
                    });
                }
                summary.updated += 1;
            }
            Pending::Removed => {}
        }
    }
    Ok(())
}

async fn delete_rows<E: PgEntity>(
    tx: &mut Transaction<'_, Postgres>,
    changes: &ChangeSet,
    summary: &mut CommitSummary,
) -> Result<(), StorageError> {
    let delete = delete_sql::<E>();
    for (key, pending) in E::pending(changes).iter() {
        if let Pending::Removed = pending {
            let result = E::bind_key(key, sqlx::query(&delete))
                .execute(&mut **tx)
                .await?;
            summary.removed += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
    }
    Ok(())
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn commit(self) -> Result<CommitSummary, StorageError> {
        let mut summary = CommitSummary::default();
        if self.changes.is_empty() {
            return Ok(summary);
        }

        let mut tx = self.pool.begin().await?;

        // Referenced rows first so inserts never trip foreign keys.
        write_rows::<TypeVacancy>(&mut tx, &self.changes, &mut summary).await?;
        write_rows::<Employment>(&mut tx, &self.changes, &mut summary).await?;
        write_rows::<Vacancy>(&mut tx, &self.changes, &mut summary).await?;
        write_rows::<Address>(&mut tx, &self.changes, &mut summary).await?;
        write_rows::<Salary>(&mut tx, &self.changes, &mut summary).await?;
        write_rows::<Contacts>(&mut tx, &self.changes, &mut summary).await?;
        write_rows::<Phone>(&mut tx, &self.changes, &mut summary).await?;

        delete_rows::<Phone>(&mut tx, &self.changes, &mut summary).await?;
        delete_rows::<Contacts>(&mut tx, &self.changes, &mut summary).await?;
        delete_rows::<Salary>(&mut tx, &self.changes, &mut summary).await?;
        delete_rows::<Address>(&mut tx, &self.changes, &mut summary).await?;
        delete_rows::<Vacancy>(&mut tx, &self.changes, &mut summary).await?;
        delete_rows::<Employment>(&mut tx, &self.changes, &mut summary).await?;
        delete_rows::<TypeVacancy>(&mut tx, &self.changes, &mut summary).await?;

        tx.commit().await?;
        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            removed = summary.removed,
            "postgres unit committed"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lists_key_then_mutable_then_extra_columns() {
        assert_eq!(
            insert_sql::<Phone>(),
            r#"INSERT INTO phones ("id", "country", "city", "number", "note", "contacts_id") VALUES ($1, $2, $3, $4, $5, $6)"#
        );
    }

    #[test]
    fn update_never_touches_insert_only_columns() {
        let sql = update_sql::<Phone>();
        assert!(!sql.contains("contacts_id"));
        assert_eq!(
            update_sql::<Salary>(),
            r#"UPDATE salaries SET "from" = $2, "to" = $3, "gross" = $4, "currency" = $5 WHERE "id" = $1"#
        );
    }

    #[test]
    fn vacancy_foreign_keys_are_written_on_insert_only() {
        assert_eq!(
            update_sql::<Vacancy>(),
            r#"UPDATE vacancies SET "name" = $2, "description" = $3, "published_at" = $4, "archived" = $5 WHERE "id" = $1"#
        );
        assert_eq!(
            insert_sql::<Vacancy>(),
            r#"INSERT INTO vacancies ("id", "name", "description", "published_at", "archived", "type_id", "employment_id") VALUES ($1, $2, $3, $4, $5, $6, $7)"#
        );
    }

    #[test]
    fn select_and_delete_address_the_key_column() {
        assert_eq!(
            select_by_key_sql::<Contacts>(),
            r#"SELECT "id", "name", "email" FROM contacts WHERE "id" = $1"#
        );
        assert_eq!(delete_sql::<TypeVacancy>(), r#"DELETE FROM type_vacancies WHERE "id" = $1"#);
    }

    #[test]
    fn only_phones_match_on_a_secondary_predicate() {
        assert!(Phone::same_filter().is_some());
        assert!(Vacancy::same_filter().is_none());
        assert!(Salary::same_filter().is_none());
    }
}

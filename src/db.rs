// src/db.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{Filters, Poll, PollOption};
use crate::store::{PollStore, StoreError, StoreResult};

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_timeout)
        .connect(&config.database_url)
        .await?;

    info!(max_connections = config.db_max_connections, "Connected to database");
    Ok(pool)
}

#[derive(FromRow)]
struct PollRow {
    id: Uuid,
    question: String,
    description: Option<String>,
    results_visibility: String,
    is_private: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ListedPollRow {
    #[sqlx(flatten)]
    poll: PollRow,
    total: i64,
}

#[derive(FromRow)]
struct OptionRow {
    id: Uuid,
    poll_id: Uuid,
    value: String,
    position: i32,
    vote_count: i64,
}

impl From<OptionRow> for PollOption {
    fn from(row: OptionRow) -> Self {
        PollOption {
            id: row.id,
            value: row.value,
            position: row.position,
            vote_count: row.vote_count,
        }
    }
}

impl PollRow {
    fn into_poll(self, options: Vec<PollOption>) -> StoreResult<Poll> {
        let results_visibility = self.results_visibility.parse().map_err(|_| {
            sqlx::Error::Decode(format!("unknown results_visibility {:?}", self.results_visibility).into())
        })?;

        Ok(Poll {
            id: self.id,
            question: self.question,
            description: self.description,
            options,
            results_visibility,
            is_private: self.is_private,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const POLL_COLUMNS: &str =
    "id, question, description, results_visibility, is_private, expires_at, created_at, updated_at";

const OPTION_COLUMNS: &str = "id, poll_id, value, position, vote_count";

/// PostgreSQL-backed [`PollStore`]. Every multi-row write runs in a single
/// transaction; position and value uniqueness is checked at commit.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    async fn options_of(&self, poll_ids: &[Uuid]) -> StoreResult<HashMap<Uuid, Vec<PollOption>>> {
        let rows = sqlx::query_as::<_, OptionRow>(&format!(
            "SELECT {OPTION_COLUMNS} FROM poll_options WHERE poll_id = ANY($1) ORDER BY position"
        ))
        .bind(poll_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<PollOption>> = HashMap::new();
        for row in rows {
            grouped.entry(row.poll_id).or_default().push(row.into());
        }
        Ok(grouped)
    }
}

async fn touch(tx: &mut Transaction<'_, Postgres>, poll_id: Uuid) -> StoreResult<DateTime<Utc>> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        "UPDATE polls SET updated_at = now() WHERE id = $1 RETURNING updated_at",
    )
    .bind(poll_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::NotFound)
}

/// Positions of the poll's options must be exactly `0..n` when the
/// transaction commits. The poll row is locked by [`touch`] beforehand, so
/// writers from other processes are serialized up to this check.
async fn ensure_dense(tx: &mut Transaction<'_, Postgres>, poll_id: Uuid) -> StoreResult<()> {
    let (count, distinct, max) = sqlx::query_as::<_, (i64, i64, i64)>(
        "SELECT count(*), count(DISTINCT position), COALESCE(max(position), -1)::bigint
         FROM poll_options WHERE poll_id = $1",
    )
    .bind(poll_id)
    .fetch_one(&mut **tx)
    .await?;

    if count != distinct || max + 1 != count {
        return Err(StoreError::InconsistentLayout);
    }
    Ok(())
}

async fn write_positions(
    tx: &mut Transaction<'_, Postgres>,
    poll_id: Uuid,
    options: &[PollOption],
) -> StoreResult<()> {
    for option in options {
        let updated = sqlx::query("UPDATE poll_options SET position = $1 WHERE id = $2 AND poll_id = $3")
            .bind(option.position)
            .bind(option.id)
            .bind(poll_id)
            .execute(&mut **tx)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
    }
    Ok(())
}

#[async_trait]
impl PollStore for PgStore {
    async fn insert_poll(&self, mut poll: Poll, token_digest: &[u8]) -> StoreResult<Poll> {
        let mut tx = self.pool.begin().await?;

        poll.id = Uuid::new_v4();
        let (created_at, updated_at) = sqlx::query_as::<_, (DateTime<Utc>, DateTime<Utc>)>(
            "INSERT INTO polls (id, question, description, results_visibility, is_private, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING created_at, updated_at",
        )
        .bind(poll.id)
        .bind(&poll.question)
        .bind(&poll.description)
        .bind(poll.results_visibility.as_str())
        .bind(poll.is_private)
        .bind(poll.expires_at)
        .fetch_one(&mut *tx)
        .await?;
        poll.created_at = created_at;
        poll.updated_at = updated_at;

        for option in poll.options.iter_mut() {
            option.id = Uuid::new_v4();
            option.vote_count = 0;
            sqlx::query("INSERT INTO poll_options (id, poll_id, value, position) VALUES ($1, $2, $3, $4)")
                .bind(option.id)
                .bind(poll.id)
                .bind(&option.value)
                .bind(option.position)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("INSERT INTO tokens (hash, poll_id) VALUES ($1, $2)")
            .bind(token_digest)
            .bind(poll.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        poll.sort_options();
        Ok(poll)
    }

    async fn get_poll(&self, id: Uuid) -> StoreResult<Poll> {
        let row = sqlx::query_as::<_, PollRow>(&format!("SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        let options = self.options_of(&[id]).await?.remove(&id).unwrap_or_default();
        row.into_poll(options)
    }

    async fn update_poll_fields(&self, poll: &Poll) -> StoreResult<DateTime<Utc>> {
        sqlx::query_scalar::<_, DateTime<Utc>>(
            "UPDATE polls SET question = $1, description = $2, expires_at = $3, updated_at = now()
             WHERE id = $4
             RETURNING updated_at",
        )
        .bind(&poll.question)
        .bind(&poll.description)
        .bind(poll.expires_at)
        .bind(poll.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn delete_poll(&self, id: Uuid) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_polls(&self, search: &str, filters: &Filters) -> StoreResult<(Vec<Poll>, i64)> {
        // Sort column and direction come from closed enums, never from input.
        let query = format!(
            "SELECT count(*) OVER() AS total, {POLL_COLUMNS}
             FROM polls
             WHERE NOT is_private
               AND (to_tsvector('simple', question) @@ plainto_tsquery('simple', $1) OR $1 = '')
             ORDER BY {} {}, id ASC
             LIMIT $2 OFFSET $3",
            filters.sort.column(),
            filters.direction.keyword(),
        );

        let rows = sqlx::query_as::<_, ListedPollRow>(&query)
            .bind(search)
            .bind(filters.limit())
            .bind(filters.offset())
            .fetch_all(&self.pool)
            .await?;

        let total = rows.first().map_or(0, |r| r.total);
        let ids: Vec<Uuid> = rows.iter().map(|r| r.poll.id).collect();
        let mut options = self.options_of(&ids).await?;

        let polls = rows
            .into_iter()
            .map(|r| {
                let opts = options.remove(&r.poll.id).unwrap_or_default();
                r.poll.into_poll(opts)
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok((polls, total))
    }

    async fn insert_option(&self, poll_id: Uuid, mut option: PollOption) -> StoreResult<PollOption> {
        let mut tx = self.pool.begin().await?;
        touch(&mut tx, poll_id).await?;

        option.id = Uuid::new_v4();
        option.vote_count = 0;
        sqlx::query("INSERT INTO poll_options (id, poll_id, value, position) VALUES ($1, $2, $3, $4)")
            .bind(option.id)
            .bind(poll_id)
            .bind(&option.value)
            .bind(option.position)
            .execute(&mut *tx)
            .await?;

        ensure_dense(&mut tx, poll_id).await?;
        tx.commit().await?;
        Ok(option)
    }

    async fn update_option_value(&self, poll_id: Uuid, option: &PollOption) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        touch(&mut tx, poll_id).await?;

        let updated = sqlx::query("UPDATE poll_options SET value = $1 WHERE id = $2 AND poll_id = $3")
            .bind(&option.value)
            .bind(option.id)
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_option_positions(&self, poll_id: Uuid, options: &[PollOption]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        touch(&mut tx, poll_id).await?;
        write_positions(&mut tx, poll_id, options).await?;
        ensure_dense(&mut tx, poll_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_option(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
        renumbered: &[PollOption],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        touch(&mut tx, poll_id).await?;

        let deleted = sqlx::query("DELETE FROM poll_options WHERE id = $1 AND poll_id = $2")
            .bind(option_id)
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        write_positions(&mut tx, poll_id, renumbered).await?;
        ensure_dense(&mut tx, poll_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_vote(&self, poll_id: Uuid, option_id: Uuid, voter: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO voters (poll_id, voter) VALUES ($1, $2) ON CONFLICT (poll_id, voter) DO NOTHING",
        )
        .bind(poll_id)
        .bind(voter)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyVoted);
        }

        // An option of another poll matches nothing; dropping the
        // transaction discards the voter row.
        let counted = sqlx::query(
            "UPDATE poll_options SET vote_count = vote_count + 1 WHERE id = $1 AND poll_id = $2",
        )
        .bind(option_id)
        .bind(poll_id)
        .execute(&mut *tx)
        .await?;
        if counted.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn has_voted(&self, poll_id: Uuid, voter: &str) -> StoreResult<bool> {
        let voted = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM voters WHERE poll_id = $1 AND voter = $2)",
        )
        .bind(poll_id)
        .bind(voter)
        .fetch_one(&self.pool)
        .await?;
        Ok(voted)
    }

    async fn get_results(&self, poll_id: Uuid) -> StoreResult<Vec<PollOption>> {
        let rows = sqlx::query_as::<_, OptionRow>(&format!(
            "SELECT {OPTION_COLUMNS} FROM poll_options WHERE poll_id = $1 ORDER BY position"
        ))
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PollOption::from).collect())
    }

    async fn resolve_token(&self, token_digest: &[u8]) -> StoreResult<Uuid> {
        sqlx::query_scalar::<_, Uuid>("SELECT poll_id FROM tokens WHERE hash = $1")
            .bind(token_digest)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }
}

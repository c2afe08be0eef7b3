//! Persistence capability consumed by [`crate::poll::PollService`].
//!
//! [`crate::db::PgStore`] backs it with PostgreSQL; [`MemoryStore`] keeps
//! everything behind a single mutex and is used by the tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Filters, Poll, PollOption, SortDirection, SortKey};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("voter already recorded for poll")]
    AlreadyVoted,

    #[error("option positions are not contiguous")]
    InconsistentLayout,

    #[error("database call timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Persists the poll, its options and the token digest together.
    /// Returns the poll with ids and timestamps assigned.
    async fn insert_poll(&self, poll: Poll, token_digest: &[u8]) -> StoreResult<Poll>;

    async fn get_poll(&self, id: Uuid) -> StoreResult<Poll>;

    /// Writes question, description and deadline. Returns the new
    /// `updated_at`.
    async fn update_poll_fields(&self, poll: &Poll) -> StoreResult<DateTime<Utc>>;

    /// Removes the poll with its options, voter records and token digest.
    async fn delete_poll(&self, id: Uuid) -> StoreResult<()>;

    /// Public polls matching `search`, one page of them, plus the total
    /// number of matches.
    async fn list_polls(&self, search: &str, filters: &Filters) -> StoreResult<(Vec<Poll>, i64)>;

    async fn insert_option(&self, poll_id: Uuid, option: PollOption) -> StoreResult<PollOption>;

    async fn update_option_value(&self, poll_id: Uuid, option: &PollOption) -> StoreResult<()>;

    async fn update_option_positions(&self, poll_id: Uuid, options: &[PollOption]) -> StoreResult<()>;

    /// Deletes the option and writes the renumbered positions in one unit.
    async fn delete_option(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
        renumbered: &[PollOption],
    ) -> StoreResult<()>;

    /// Records the voter and increments the option's tally in one unit.
    async fn record_vote(&self, poll_id: Uuid, option_id: Uuid, voter: &str) -> StoreResult<()>;

    async fn has_voted(&self, poll_id: Uuid, voter: &str) -> StoreResult<bool>;

    async fn get_results(&self, poll_id: Uuid) -> StoreResult<Vec<PollOption>>;

    async fn resolve_token(&self, token_digest: &[u8]) -> StoreResult<Uuid>;
}

#[derive(Debug, Default)]
struct Tables {
    polls: HashMap<Uuid, Poll>,
    voters: HashSet<(Uuid, String)>,
    tokens: HashMap<Vec<u8>, Uuid>,
}

impl Tables {
    fn poll_mut(&mut self, id: Uuid) -> StoreResult<&mut Poll> {
        self.polls.get_mut(&id).ok_or(StoreError::NotFound)
    }
}

fn touch(poll: &mut Poll) {
    poll.updated_at = Utc::now().max(poll.updated_at);
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of voter records held for a poll.
    pub fn voter_count(&self, poll_id: Uuid) -> usize {
        self.tables().voters.iter().filter(|(p, _)| *p == poll_id).count()
    }

    pub fn token_count(&self) -> usize {
        self.tables().tokens.len()
    }
}

fn matches_search(question: &str, search: &str) -> bool {
    let words: HashSet<String> = question
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    search
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .all(|w| words.contains(&w.to_lowercase()))
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn insert_poll(&self, mut poll: Poll, token_digest: &[u8]) -> StoreResult<Poll> {
        let now = Utc::now();
        poll.id = Uuid::new_v4();
        poll.created_at = now;
        poll.updated_at = now;
        for option in poll.options.iter_mut() {
            option.id = Uuid::new_v4();
            option.vote_count = 0;
        }
        poll.sort_options();

        let mut tables = self.tables();
        tables.tokens.insert(token_digest.to_vec(), poll.id);
        tables.polls.insert(poll.id, poll.clone());
        Ok(poll)
    }

    async fn get_poll(&self, id: Uuid) -> StoreResult<Poll> {
        self.tables().polls.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_poll_fields(&self, poll: &Poll) -> StoreResult<DateTime<Utc>> {
        let mut tables = self.tables();
        let stored = tables.poll_mut(poll.id)?;
        stored.question = poll.question.clone();
        stored.description = poll.description.clone();
        stored.expires_at = poll.expires_at;
        touch(stored);
        Ok(stored.updated_at)
    }

    async fn delete_poll(&self, id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables();
        tables.polls.remove(&id).ok_or(StoreError::NotFound)?;
        tables.voters.retain(|(poll_id, _)| *poll_id != id);
        tables.tokens.retain(|_, poll_id| *poll_id != id);
        Ok(())
    }

    async fn list_polls(&self, search: &str, filters: &Filters) -> StoreResult<(Vec<Poll>, i64)> {
        let tables = self.tables();
        let mut polls: Vec<Poll> = tables
            .polls
            .values()
            .filter(|p| !p.is_private && matches_search(&p.question, search))
            .cloned()
            .collect();

        polls.sort_by(|a, b| {
            let ordering = match filters.sort {
                SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
                SortKey::Question => a.question.cmp(&b.question),
            };
            let ordering = match filters.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            ordering.then(a.id.cmp(&b.id))
        });

        let total = polls.len() as i64;
        let page = polls
            .into_iter()
            .skip(filters.offset() as usize)
            .take(filters.limit() as usize)
            .collect();
        Ok((page, total))
    }

    async fn insert_option(&self, poll_id: Uuid, mut option: PollOption) -> StoreResult<PollOption> {
        let mut tables = self.tables();
        let poll = tables.poll_mut(poll_id)?;
        option.id = Uuid::new_v4();
        option.vote_count = 0;
        poll.options.push(option.clone());
        poll.sort_options();
        touch(poll);
        Ok(option)
    }

    async fn update_option_value(&self, poll_id: Uuid, option: &PollOption) -> StoreResult<()> {
        let mut tables = self.tables();
        let poll = tables.poll_mut(poll_id)?;
        let stored = poll
            .options
            .iter_mut()
            .find(|o| o.id == option.id)
            .ok_or(StoreError::NotFound)?;
        stored.value = option.value.clone();
        touch(poll);
        Ok(())
    }

    async fn update_option_positions(&self, poll_id: Uuid, options: &[PollOption]) -> StoreResult<()> {
        let mut tables = self.tables();
        let poll = tables.poll_mut(poll_id)?;
        if options.iter().any(|o| poll.option(o.id).is_none()) {
            return Err(StoreError::NotFound);
        }
        for update in options {
            if let Some(stored) = poll.options.iter_mut().find(|o| o.id == update.id) {
                stored.position = update.position;
            }
        }
        poll.sort_options();
        touch(poll);
        Ok(())
    }

    async fn delete_option(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
        renumbered: &[PollOption],
    ) -> StoreResult<()> {
        let mut tables = self.tables();
        let poll = tables.poll_mut(poll_id)?;
        if poll.option(option_id).is_none()
            || renumbered.iter().any(|o| o.id == option_id || poll.option(o.id).is_none())
        {
            return Err(StoreError::NotFound);
        }

        poll.options.retain(|o| o.id != option_id);
        for update in renumbered {
            if let Some(stored) = poll.options.iter_mut().find(|o| o.id == update.id) {
                stored.position = update.position;
            }
        }
        poll.sort_options();
        touch(poll);
        Ok(())
    }

    async fn record_vote(&self, poll_id: Uuid, option_id: Uuid, voter: &str) -> StoreResult<()> {
        let mut tables = self.tables();
        let key = (poll_id, voter.to_string());
        if tables.voters.contains(&key) {
            return Err(StoreError::AlreadyVoted);
        }

        let option = tables
            .polls
            .get_mut(&poll_id)
            .and_then(|poll| poll.options.iter_mut().find(|o| o.id == option_id))
            .ok_or(StoreError::NotFound)?;
        option.vote_count += 1;
        tables.voters.insert(key);
        Ok(())
    }

    async fn has_voted(&self, poll_id: Uuid, voter: &str) -> StoreResult<bool> {
        Ok(self.tables().voters.contains(&(poll_id, voter.to_string())))
    }

    async fn get_results(&self, poll_id: Uuid) -> StoreResult<Vec<PollOption>> {
        let tables = self.tables();
        let poll = tables.polls.get(&poll_id).ok_or(StoreError::NotFound)?;
        Ok(poll.options.clone())
    }

    async fn resolve_token(&self, token_digest: &[u8]) -> StoreResult<Uuid> {
        self.tables()
            .tokens
            .get(token_digest)
            .copied()
            .ok_or(StoreError::NotFound)
    }
}

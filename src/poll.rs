// src/poll.rs
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{self, Token};
use crate::error::{AppError, AppResult};
use crate::models::{
    CreatePollInput, CreatedPoll, Filters, Metadata, OptionPosition, OptionResult, Poll,
    PollOption, PollPage, PollView, ResultsVisibility, UpdatePollInput,
};
use crate::ordering;
use crate::store::{PollStore, StoreError, StoreResult};
use crate::validation::{self, Validator};
use crate::visibility::{self, Requirement};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

/// Prune idle lock entries once the table grows past this.
const LOCK_PRUNE_AT: usize = 1024;

/// One async lock per poll. Vote admission holds it across the has-voted
/// check and the recording of the vote; owner edits hold it from the read
/// of the poll until the write commits.
#[derive(Debug, Default)]
pub struct PollLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl PollLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, poll_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            if locks.len() >= LOCK_PRUNE_AT {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(poll_id).or_default())
        };
        lock.lock_owned().await
    }

    pub fn forget(&self, poll_id: Uuid) {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&poll_id);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Create, vote, show results, edit and delete polls. Every operation
/// resolves the poll first; owner-only operations then check the token and
/// (except deletion) the deadline before validating and writing.
pub struct PollService {
    store: Arc<dyn PollStore>,
    locks: PollLocks,
    timeout: Duration,
}

impl PollService {
    pub fn new(store: Arc<dyn PollStore>) -> Self {
        Self::with_timeout(store, DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(store: Arc<dyn PollStore>, timeout: Duration) -> Self {
        PollService {
            store,
            locks: PollLocks::new(),
            timeout,
        }
    }

    pub fn locks(&self) -> &PollLocks {
        &self.locks
    }

    async fn call<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }

    async fn fetch(&self, poll_id: Uuid) -> AppResult<Poll> {
        Ok(self.call(self.store.get_poll(poll_id)).await?)
    }

    /// Loads the poll, then checks that `credential` was issued for it.
    async fn fetch_owned(&self, poll_id: Uuid, credential: &str) -> AppResult<Poll> {
        let poll = self.fetch(poll_id).await?;
        let owner_of = tokio::time::timeout(self.timeout, auth::resolve(self.store.as_ref(), credential))
            .await
            .map_err(|_| AppError::from(StoreError::Timeout))??;
        auth::ensure_scope(owner_of, poll_id)?;
        Ok(poll)
    }

    /// Takes the poll's lock, then loads it as [`Self::fetch_owned`] does;
    /// the poll must still be open. The caller holds the guard until its
    /// write has committed.
    async fn fetch_editable(
        &self,
        poll_id: Uuid,
        credential: &str,
    ) -> AppResult<(OwnedMutexGuard<()>, Poll)> {
        let guard = self.locks.acquire(poll_id).await;
        let poll = self.fetch_owned(poll_id, credential).await?;
        if poll.is_expired(Utc::now()) {
            return Err(AppError::Expired);
        }
        Ok((guard, poll))
    }

    pub async fn create_poll(&self, input: CreatePollInput) -> AppResult<CreatedPoll> {
        let CreatePollInput {
            question,
            description,
            options,
            expires_at,
            results_visibility,
            is_private,
        } = input;

        let options = options
            .into_iter()
            .map(|o| PollOption::new(o.value.trim(), o.position))
            .collect();

        let mut poll = Poll::draft(question.trim(), options);
        poll.description = normalize_description(description);
        poll.expires_at = expires_at;
        poll.is_private = is_private;

        let mut v = Validator::new();
        validation::check_poll(&mut v, &poll, Utc::now());
        match results_visibility.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => poll.results_visibility = ResultsVisibility::Always,
            Some(raw) => match raw.parse() {
                Ok(mode) => poll.results_visibility = mode,
                Err(_) => validation::check_visibility(&mut v, raw),
            },
        }
        v.finish()?;

        let token = Token::generate();
        let poll = self.call(self.store.insert_poll(poll, &token.digest)).await?;
        info!(poll_id = %poll.id, options = poll.options.len(), "Poll created");

        Ok(CreatedPoll {
            poll: PollView::from(&poll),
            token: token.plaintext,
        })
    }

    pub async fn get_poll(&self, poll_id: Uuid) -> AppResult<PollView> {
        let poll = self.fetch(poll_id).await?;
        Ok(PollView::from(&poll))
    }

    pub async fn list_polls(&self, search: &str, filters: Filters) -> AppResult<PollPage> {
        let (polls, total) = self.call(self.store.list_polls(search.trim(), &filters)).await?;
        Ok(PollPage {
            polls: polls.iter().map(PollView::from).collect(),
            metadata: Metadata::calculate(total, filters.page, filters.page_size),
        })
    }

    pub async fn vote(&self, poll_id: Uuid, option_id: Uuid, voter: &str) -> AppResult<()> {
        let poll = self.fetch(poll_id).await?;
        if poll.is_expired(Utc::now()) {
            return Err(AppError::Expired);
        }

        let _guard = self.locks.acquire(poll_id).await;
        if self.call(self.store.has_voted(poll_id, voter)).await? {
            return Err(AppError::AlreadyVoted);
        }
        self.call(self.store.record_vote(poll_id, option_id, voter)).await?;

        info!(%poll_id, %option_id, "Vote recorded");
        Ok(())
    }

    pub async fn results(&self, poll_id: Uuid, requester: &str) -> AppResult<Vec<OptionResult>> {
        let poll = self.fetch(poll_id).await?;
        let now = Utc::now();

        let has_voted = match visibility::requirement(&poll, now) {
            Requirement::HasVoted => self.call(self.store.has_voted(poll_id, requester)).await?,
            _ => false,
        };
        visibility::check(&poll, has_voted, now).map_err(AppError::ResultsWithheld)?;

        let mut options = self.call(self.store.get_results(poll_id)).await?;
        options.sort_by_key(|o| o.position);
        Ok(options.into_iter().map(OptionResult::from).collect())
    }

    pub async fn update_poll(
        &self,
        poll_id: Uuid,
        credential: &str,
        input: UpdatePollInput,
    ) -> AppResult<PollView> {
        let (_guard, mut poll) = self.fetch_editable(poll_id, credential).await?;
        if input.is_empty() {
            return Err(AppError::BadRequest("no fields provided for update".into()));
        }

        if let Some(question) = input.question {
            poll.question = question.trim().to_string();
        }
        if let Some(description) = input.description {
            poll.description = normalize_description(Some(description));
        }
        if input.expires_at.is_some() {
            poll.expires_at = input.expires_at;
        }

        validation::validate_poll(&poll, Utc::now())?;
        poll.updated_at = self.call(self.store.update_poll_fields(&poll)).await?;
        Ok(PollView::from(&poll))
    }

    pub async fn add_option(
        &self,
        poll_id: Uuid,
        credential: &str,
        value: &str,
        position: i32,
    ) -> AppResult<PollView> {
        let (_guard, mut poll) = self.fetch_editable(poll_id, credential).await?;

        let value = value.trim();
        poll.options = ordering::insert(&poll.options, value, position);
        validation::validate_poll(&poll, Utc::now())?;

        self.call(self.store.insert_option(poll_id, PollOption::new(value, position)))
            .await?;
        Ok(PollView::from(&self.fetch(poll_id).await?))
    }

    pub async fn update_option_value(
        &self,
        poll_id: Uuid,
        credential: &str,
        option_id: Uuid,
        value: &str,
    ) -> AppResult<()> {
        let (_guard, mut poll) = self.fetch_editable(poll_id, credential).await?;

        let option = poll
            .options
            .iter_mut()
            .find(|o| o.id == option_id)
            .ok_or(AppError::NotFound)?;
        option.value = value.trim().to_string();
        let updated = option.clone();

        validation::validate_poll(&poll, Utc::now())?;
        self.call(self.store.update_option_value(poll_id, &updated)).await?;
        Ok(())
    }

    pub async fn reposition_options(
        &self,
        poll_id: Uuid,
        credential: &str,
        moves: &[OptionPosition],
    ) -> AppResult<Vec<PollOption>> {
        let (_guard, mut poll) = self.fetch_editable(poll_id, credential).await?;

        let moves: Vec<(Uuid, i32)> = moves.iter().map(|m| (m.id, m.position)).collect();
        let reordering = ordering::reposition(&poll.options, &moves)?;
        poll.options = reordering.options;
        validation::validate_poll(&poll, Utc::now())?;

        self.call(self.store.update_option_positions(poll_id, &reordering.moved))
            .await?;
        Ok(poll.options)
    }

    /// Deleting may leave fewer than two options; the next write that
    /// validates the whole poll fails until one is added back.
    pub async fn delete_option(&self, poll_id: Uuid, credential: &str, option_id: Uuid) -> AppResult<()> {
        let (_guard, poll) = self.fetch_editable(poll_id, credential).await?;

        let removal = ordering::remove(&poll.options, option_id)?;
        if !validation::is_dense_layout(&removal.options) {
            warn!(%poll_id, "Stored option positions are not contiguous");
            return Err(AppError::internal(format!(
                "option layout of poll {poll_id} is inconsistent"
            )));
        }

        self.call(self.store.delete_option(poll_id, option_id, &removal.renumbered))
            .await?;
        info!(%poll_id, %option_id, renumbered = removal.renumbered.len(), "Option deleted");
        Ok(())
    }

    /// Owners may delete expired polls too.
    pub async fn delete_poll(&self, poll_id: Uuid, credential: &str) -> AppResult<()> {
        let _guard = self.locks.acquire(poll_id).await;
        self.fetch_owned(poll_id, credential).await?;
        self.call(self.store.delete_poll(poll_id)).await?;
        self.locks.forget(poll_id);
        info!(%poll_id, "Poll deleted");
        Ok(())
    }
}

/// An absent or empty description means none; anything else is kept for
/// validation to judge.
fn normalize_description(raw: Option<String>) -> Option<String> {
    match raw {
        Some(d) if !d.is_empty() => Some(d.trim().to_string()),
        _ => None,
    }
}

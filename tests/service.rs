use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use polls::models::{
    CreatePollInput, CreatedPoll, Filters, OptionInput, OptionPosition, Poll, PollOption,
    ResultsVisibility, UpdatePollInput,
};
use polls::store::{MemoryStore, PollStore, StoreResult};
use polls::visibility::Withheld;
use polls::{AppError, PollService};

fn setup() -> (Arc<MemoryStore>, Arc<PollService>) {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(PollService::new(store.clone()));
    (store, service)
}

fn input(question: &str, options: &[&str]) -> CreatePollInput {
    CreatePollInput {
        question: question.to_string(),
        options: options
            .iter()
            .enumerate()
            .map(|(i, v)| OptionInput {
                value: v.to_string(),
                position: i as i32,
            })
            .collect(),
        ..CreatePollInput::default()
    }
}

async fn create(service: &PollService, question: &str, options: &[&str]) -> CreatedPoll {
    service.create_poll(input(question, options)).await.unwrap()
}

/// Inserts a poll directly, skipping creation rules, so deadlines can be in
/// the past.
async fn seed(store: &MemoryStore, visibility: ResultsVisibility, expires_in: Option<Duration>) -> Poll {
    let mut poll = Poll::draft(
        "seeded",
        vec![PollOption::new("yes", 0), PollOption::new("no", 1)],
    );
    poll.results_visibility = visibility;
    poll.expires_at = expires_in.map(|d| Utc::now() + d);
    store.insert_poll(poll, Uuid::new_v4().as_bytes()).await.unwrap()
}

async fn vote_count(service: &PollService, poll_id: Uuid, value: &str) -> i64 {
    service
        .results(poll_id, "observer")
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.value == value)
        .map(|r| r.vote_count)
        .unwrap()
}

#[tokio::test]
async fn create_vote_delete_option_scenario() {
    let (_, service) = setup();
    let mut request = input("Which one?", &["second", "first"]);
    request.options[0].position = 1;
    request.options[1].position = 0;
    request.expires_at = Some(Utc::now() + Duration::minutes(2));

    let created = service.create_poll(request).await.unwrap();
    let values: Vec<&str> = created.poll.options.iter().map(|o| o.value.as_str()).collect();
    assert_eq!(values, ["first", "second"]);

    let poll_id = created.poll.id;
    let first = created.poll.options[0].id;
    let second = created.poll.options[1].id;

    service.vote(poll_id, first, "A").await.unwrap();
    assert_eq!(vote_count(&service, poll_id, "first").await, 1);

    let again = service.vote(poll_id, first, "A").await;
    assert!(matches!(again, Err(AppError::AlreadyVoted)));
    assert_eq!(vote_count(&service, poll_id, "first").await, 1);

    service
        .delete_option(poll_id, &created.token, second)
        .await
        .unwrap();
    let poll = service.get_poll(poll_id).await.unwrap();
    assert_eq!(poll.options.len(), 1);
    assert_eq!(poll.options[0].value, "first");
    assert_eq!(poll.options[0].position, 0);

    // One option left: any write that validates the poll now fails.
    let update = UpdatePollInput {
        question: Some("Still there?".into()),
        ..UpdatePollInput::default()
    };
    match service.update_poll(poll_id, &created.token, update).await {
        Err(AppError::Validation(errors)) => {
            assert_eq!(errors.first("options"), Some("must contain at least two options"));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }

    let view = service
        .add_option(poll_id, &created.token, "third", 1)
        .await
        .unwrap();
    assert_eq!(view.options.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_votes_from_one_origin_count_once() {
    let (store, service) = setup();
    let created = create(&service, "Race?", &["yes", "no"]).await;
    let poll_id = created.poll.id;
    let option = created.poll.options[0].id;

    let attempts = 32;
    let handles: Vec<_> = (0..attempts)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.vote(poll_id, option, "10.0.0.1").await })
        })
        .collect();

    let mut accepted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => accepted += 1,
            Err(AppError::AlreadyVoted) => rejected += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(rejected, attempts - 1);
    assert_eq!(vote_count(&service, poll_id, "yes").await, 1);
    assert_eq!(store.voter_count(poll_id), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_votes_from_distinct_origins_all_count() {
    let (_, service) = setup();
    let created = create(&service, "Crowd?", &["yes", "no"]).await;
    let poll_id = created.poll.id;
    let option = created.poll.options[1].id;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move { service.vote(poll_id, option, &format!("10.0.0.{i}")).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(vote_count(&service, poll_id, "no").await, 20);
}

#[tokio::test]
async fn vote_rejections() {
    let (store, service) = setup();
    let created = create(&service, "Q?", &["a", "b"]).await;

    assert!(matches!(
        service.vote(Uuid::new_v4(), created.poll.options[0].id, "ip").await,
        Err(AppError::NotFound)
    ));
    assert!(matches!(
        service.vote(created.poll.id, Uuid::new_v4(), "ip").await,
        Err(AppError::NotFound)
    ));
    assert!(!store.has_voted(created.poll.id, "ip").await.unwrap());

    let expired = seed(&store, ResultsVisibility::Always, Some(-Duration::minutes(1))).await;
    assert!(matches!(
        service.vote(expired.id, expired.options[0].id, "ip").await,
        Err(AppError::Expired)
    ));
}

#[tokio::test]
async fn after_vote_results_need_a_vote_until_expiry() {
    let (store, service) = setup();
    let poll = seed(&store, ResultsVisibility::AfterVote, Some(Duration::hours(1))).await;

    match service.results(poll.id, "A").await {
        Err(AppError::ResultsWithheld(reason)) => assert_eq!(reason, Withheld::UntilVoted),
        other => panic!("expected results to be withheld, got {other:?}"),
    }

    service.vote(poll.id, poll.options[0].id, "A").await.unwrap();
    let results = service.results(poll.id, "A").await.unwrap();
    assert_eq!(results[0].vote_count, 1);
    assert!(service.results(poll.id, "B").await.is_err());

    let closed = seed(&store, ResultsVisibility::AfterVote, Some(-Duration::seconds(1))).await;
    assert!(service.results(closed.id, "B").await.is_ok());
}

#[tokio::test]
async fn after_deadline_results_wait_for_the_deadline() {
    let (store, service) = setup();

    let open = seed(&store, ResultsVisibility::AfterDeadline, Some(Duration::hours(1))).await;
    match service.results(open.id, "A").await {
        Err(AppError::ResultsWithheld(reason)) => assert_eq!(reason, Withheld::UntilExpired),
        other => panic!("expected results to be withheld, got {other:?}"),
    }

    let closed = seed(&store, ResultsVisibility::AfterDeadline, Some(-Duration::seconds(1))).await;
    assert!(service.results(closed.id, "A").await.is_ok());

    let open_ended = seed(&store, ResultsVisibility::AfterDeadline, None).await;
    assert!(service.results(open_ended.id, "A").await.is_ok());
}

#[tokio::test]
async fn tokens_are_scoped_to_their_poll() {
    let (_, service) = setup();
    let a = create(&service, "A?", &["x", "y"]).await;
    let b = create(&service, "B?", &["x", "y"]).await;

    let update = || UpdatePollInput {
        question: Some("Hijacked?".into()),
        ..UpdatePollInput::default()
    };

    assert!(matches!(
        service.update_poll(b.poll.id, &a.token, update()).await,
        Err(AppError::WrongPoll)
    ));
    assert!(matches!(
        service.update_poll(b.poll.id, "AAAAAAAAAAAAAAAAAAAAAAAAAA", update()).await,
        Err(AppError::Unauthorized)
    ));
    assert!(matches!(
        service.update_poll(b.poll.id, "short", update()).await,
        Err(AppError::Unauthorized)
    ));
    assert!(matches!(
        service.update_poll(Uuid::new_v4(), &a.token, update()).await,
        Err(AppError::NotFound)
    ));
    assert!(matches!(
        service.delete_poll(b.poll.id, &a.token).await,
        Err(AppError::WrongPoll)
    ));

    let updated = service.update_poll(b.poll.id, &b.token, update()).await.unwrap();
    assert_eq!(updated.question, "Hijacked?");
}

#[tokio::test]
async fn private_polls_are_reachable_only_by_id() {
    let (_, service) = setup();
    create(&service, "public lunch vote", &["pizza", "sushi"]).await;
    let mut hidden = input("private lunch vote", &["pizza", "sushi"]);
    hidden.is_private = true;
    let hidden = service.create_poll(hidden).await.unwrap();

    let page = service.list_polls("lunch", Filters::default()).await.unwrap();
    assert_eq!(page.polls.len(), 1);
    assert_eq!(page.metadata.total_records, 1);
    assert!(page.polls.iter().all(|p| !p.is_private));

    let page = service.list_polls("private", Filters::default()).await.unwrap();
    assert!(page.polls.is_empty());
    assert_eq!(page.metadata.total_records, 0);

    let direct = service.get_poll(hidden.poll.id).await.unwrap();
    assert!(direct.is_private);
}

#[tokio::test]
async fn reposition_swaps_and_rejects_bad_layouts() {
    let (_, service) = setup();
    let created = create(&service, "Order?", &["a", "b", "c"]).await;
    let poll_id = created.poll.id;
    let [a, b, c] = [0, 1, 2].map(|i| created.poll.options[i].id);

    let swap = [
        OptionPosition { id: a, position: 2 },
        OptionPosition { id: c, position: 0 },
    ];
    service
        .reposition_options(poll_id, &created.token, &swap)
        .await
        .unwrap();
    let values: Vec<String> = service
        .get_poll(poll_id)
        .await
        .unwrap()
        .options
        .into_iter()
        .map(|o| o.value)
        .collect();
    assert_eq!(values, ["c", "b", "a"]);

    let clash = [OptionPosition { id: b, position: 0 }];
    assert!(matches!(
        service.reposition_options(poll_id, &created.token, &clash).await,
        Err(AppError::Validation(_))
    ));

    let unknown = [OptionPosition {
        id: Uuid::new_v4(),
        position: 0,
    }];
    assert!(matches!(
        service.reposition_options(poll_id, &created.token, &unknown).await,
        Err(AppError::BadRequest(_))
    ));

    assert!(matches!(
        service.reposition_options(poll_id, &created.token, &[]).await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn deleting_a_middle_option_keeps_the_rest_in_order() {
    let (_, service) = setup();
    let created = create(&service, "Pick?", &["a", "b", "c", "d"]).await;
    let b = created.poll.options[1].id;

    service
        .delete_option(created.poll.id, &created.token, b)
        .await
        .unwrap();

    let poll = service.get_poll(created.poll.id).await.unwrap();
    let layout: Vec<(&str, i32)> = poll
        .options
        .iter()
        .map(|o| (o.value.as_str(), o.position))
        .collect();
    assert_eq!(layout, [("a", 0), ("c", 1), ("d", 2)]);
}

#[tokio::test]
async fn option_values_stay_unique() {
    let (_, service) = setup();
    let created = create(&service, "Colour?", &["red", "blue"]).await;
    let blue = created.poll.options[1].id;

    assert!(matches!(
        service
            .update_option_value(created.poll.id, &created.token, blue, " red ")
            .await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        service
            .add_option(created.poll.id, &created.token, "red", 2)
            .await,
        Err(AppError::Validation(_))
    ));

    service
        .update_option_value(created.poll.id, &created.token, blue, "green")
        .await
        .unwrap();
    let poll = service.get_poll(created.poll.id).await.unwrap();
    assert_eq!(poll.options[1].value, "green");
}

#[tokio::test]
async fn delete_poll_removes_everything() {
    let (store, service) = setup();
    let created = create(&service, "Gone?", &["a", "b"]).await;
    service
        .vote(created.poll.id, created.poll.options[0].id, "ip")
        .await
        .unwrap();

    service
        .delete_poll(created.poll.id, &created.token)
        .await
        .unwrap();

    assert!(matches!(
        service.get_poll(created.poll.id).await,
        Err(AppError::NotFound)
    ));
    assert_eq!(store.voter_count(created.poll.id), 0);
    assert_eq!(store.token_count(), 0);
}

/// Delegates to a [`MemoryStore`], pausing before option writes so that
/// concurrent edits overlap.
struct SlowStore {
    inner: MemoryStore,
    delay: StdDuration,
}

#[async_trait]
impl PollStore for SlowStore {
    async fn insert_poll(&self, poll: Poll, token_digest: &[u8]) -> StoreResult<Poll> {
        self.inner.insert_poll(poll, token_digest).await
    }
    async fn get_poll(&self, id: Uuid) -> StoreResult<Poll> {
        self.inner.get_poll(id).await
    }
    async fn update_poll_fields(&self, poll: &Poll) -> StoreResult<DateTime<Utc>> {
        self.inner.update_poll_fields(poll).await
    }
    async fn delete_poll(&self, id: Uuid) -> StoreResult<()> {
        self.inner.delete_poll(id).await
    }
    async fn list_polls(&self, search: &str, filters: &Filters) -> StoreResult<(Vec<Poll>, i64)> {
        self.inner.list_polls(search, filters).await
    }
    async fn insert_option(&self, poll_id: Uuid, option: PollOption) -> StoreResult<PollOption> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_option(poll_id, option).await
    }
    async fn update_option_value(&self, poll_id: Uuid, option: &PollOption) -> StoreResult<()> {
        self.inner.update_option_value(poll_id, option).await
    }
    async fn update_option_positions(&self, poll_id: Uuid, options: &[PollOption]) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.update_option_positions(poll_id, options).await
    }
    async fn delete_option(&self, poll_id: Uuid, option_id: Uuid, renumbered: &[PollOption]) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete_option(poll_id, option_id, renumbered).await
    }
    async fn record_vote(&self, poll_id: Uuid, option_id: Uuid, voter: &str) -> StoreResult<()> {
        self.inner.record_vote(poll_id, option_id, voter).await
    }
    async fn has_voted(&self, poll_id: Uuid, voter: &str) -> StoreResult<bool> {
        self.inner.has_voted(poll_id, voter).await
    }
    async fn get_results(&self, poll_id: Uuid) -> StoreResult<Vec<PollOption>> {
        self.inner.get_results(poll_id).await
    }
    async fn resolve_token(&self, token_digest: &[u8]) -> StoreResult<Uuid> {
        self.inner.resolve_token(token_digest).await
    }
}

fn slow_service() -> Arc<PollService> {
    Arc::new(PollService::new(Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: StdDuration::from_millis(200),
    })))
}

async fn layout(service: &PollService, poll_id: Uuid) -> Vec<(String, i32)> {
    service
        .get_poll(poll_id)
        .await
        .unwrap()
        .options
        .into_iter()
        .map(|o| (o.value, o.position))
        .collect()
}

fn pairs(expected: &[(&str, i32)]) -> Vec<(String, i32)> {
    expected.iter().map(|(v, p)| (v.to_string(), *p)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_add_and_delete_keep_positions_dense() {
    let service = slow_service();
    let created = create(&service, "Overlap?", &["a", "b", "c"]).await;
    let poll_id = created.poll.id;
    let a = created.poll.options[0].id;

    let adding = {
        let service = service.clone();
        let token = created.token.clone();
        tokio::spawn(async move { service.add_option(poll_id, &token, "d", 3).await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    service.delete_option(poll_id, &created.token, a).await.unwrap();
    adding.await.unwrap().unwrap();

    assert_eq!(
        layout(&service, poll_id).await,
        pairs(&[("b", 0), ("c", 1), ("d", 2)])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deletes_keep_positions_dense() {
    let service = slow_service();
    let created = create(&service, "Shrink?", &["a", "b", "c", "d", "e"]).await;
    let poll_id = created.poll.id;
    let doomed = [0, 2, 4].map(|i| created.poll.options[i].id);

    let handles: Vec<_> = doomed
        .into_iter()
        .map(|option_id| {
            let service = service.clone();
            let token = created.token.clone();
            tokio::spawn(async move { service.delete_option(poll_id, &token, option_id).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(layout(&service, poll_id).await, pairs(&[("b", 0), ("d", 1)]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reposition_waits_for_a_pending_delete() {
    let service = slow_service();
    let created = create(&service, "Shuffle?", &["a", "b", "c"]).await;
    let poll_id = created.poll.id;
    let [a, b, c] = [0, 1, 2].map(|i| created.poll.options[i].id);

    let deleting = {
        let service = service.clone();
        let token = created.token.clone();
        tokio::spawn(async move { service.delete_option(poll_id, &token, a).await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    // Computed against the poll after the delete: b and c swap.
    let swap = [
        OptionPosition { id: b, position: 1 },
        OptionPosition { id: c, position: 0 },
    ];
    service
        .reposition_options(poll_id, &created.token, &swap)
        .await
        .unwrap();
    deleting.await.unwrap().unwrap();

    assert_eq!(layout(&service, poll_id).await, pairs(&[("c", 0), ("b", 1)]));
}

//! Repository behaviour over the in-memory store with the task-tracking entities.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use taskhub_core::{FilterOp, Page, Patch, QuerySpec};
use taskhub_infra::cache::{Cache, InMemoryCache};
use taskhub_infra::repository::{
    AuditAction, InMemoryStore, MemoryAuditSink, Repository, RepositoryError, StoreError,
};
use taskhub_infra::retry::{RetryConfig, RetryPolicy};
use taskhub_tasks::{NewTask, NewUser, Task, TaskStatus, User};

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(RetryConfig::exponential(3, Duration::from_millis(1), Duration::from_millis(5)))
}

fn repos(store: &InMemoryStore) -> (Repository<User, InMemoryStore>, Repository<Task, InMemoryStore>) {
    (
        Repository::new(store.clone()).with_retry(fast_retry()),
        Repository::new(store.clone()).with_retry(fast_retry()),
    )
}

async fn seeded_tasks(tasks: &Repository<Task, InMemoryStore>, user: &User, completed: usize, pending: usize) {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut inputs = Vec::new();
    for i in 0..(completed + pending) {
        let status = if i < completed { TaskStatus::Completed } else { TaskStatus::Pending };
        inputs.push(
            NewTask::new(user.id, format!("task {i}"))
                .with_status(status)
                .created_at(base + chrono::Duration::hours(i as i64)),
        );
    }
    tasks.bulk_create(inputs).await.unwrap();
}

#[tokio::test]
async fn completed_tasks_newest_first_bounded_by_limit() -> anyhow::Result<()> {
    let store = InMemoryStore::new();
    let (users, tasks) = repos(&store);
    let owner = users.create(NewUser::new("ada", "ada@example.com")).await?;
    seeded_tasks(&tasks, &owner, 15, 5).await;

    let spec = QuerySpec::<Task>::builder()
        .eq("status", TaskStatus::Completed)
        .order_by("created_at", false)
        .build()?;
    let page = tasks.get_multi(&spec, Page::new(0, 10)?, &[]).await?;

    assert_eq!(page.len(), 10);
    assert!(page.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(page.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    assert_eq!(page[0].title, "task 14");

    let rest = tasks.get_multi(&spec, Page::new(10, 10)?, &[]).await?;
    assert_eq!(rest.len(), 5);
    assert_eq!(tasks.count(&spec).await?, 15);
    Ok(())
}

#[tokio::test]
async fn bulk_create_is_all_or_nothing() {
    let store = InMemoryStore::new();
    let (users, _) = repos(&store);

    let inputs = vec![
        NewUser::new("u0", "u0@example.com"),
        NewUser::new("u1", "u1@example.com"),
        NewUser::new("u2", "u0@example.com"),
        NewUser::new("u3", "u3@example.com"),
        NewUser::new("u4", "u4@example.com"),
    ];
    let err = users.bulk_create(inputs).await.unwrap_err();

    assert!(matches!(err, RepositoryError::ConstraintViolation { .. }));
    assert_eq!(err.field(), Some("email"));
    assert!(!err.is_retryable());
    assert_eq!(store.row_count("users"), 0);
    assert_eq!(users.count(&QuerySpec::all()).await.unwrap(), 0);
}

#[tokio::test]
async fn eager_loading_attaches_both_directions() {
    let store = InMemoryStore::new();
    let (users, tasks) = repos(&store);
    let ada = users.create(NewUser::new("ada", "ada@example.com")).await.unwrap();
    let bob = users.create(NewUser::new("bob", "bob@example.com")).await.unwrap();
    seeded_tasks(&tasks, &ada, 2, 1).await;

    let with_owner = tasks.get_multi(&QuerySpec::all(), Page::default(), &["user"]).await.unwrap();
    assert_eq!(with_owner.len(), 3);
    assert!(with_owner
        .iter()
        .all(|t| t.user.as_ref().map(|u| u.id) == Some(ada.id)));

    let spec = QuerySpec::<User>::builder().order_by("username", true).build().unwrap();
    let owners = users.get_multi(&spec, Page::default(), &["tasks"]).await.unwrap();
    assert_eq!(owners[0].id, ada.id);
    assert_eq!(owners[0].tasks.as_ref().map(Vec::len), Some(3));
    assert_eq!(owners[1].id, bob.id);
    assert_eq!(owners[1].tasks.as_ref().map(Vec::len), Some(0));

    let err = tasks.get_multi(&QuerySpec::all(), Page::default(), &["project"]).await.unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidQuery { .. }));
}

#[tokio::test]
async fn updates_and_deletes_are_audited_with_old_values() {
    let store = InMemoryStore::new();
    let sink = Arc::new(MemoryAuditSink::new());
    let users: Repository<User, _> = Repository::new(store.clone()).with_audit(sink.clone());
    let tasks: Repository<Task, _> = Repository::new(store.clone()).with_audit(sink.clone());

    let owner = users.create(NewUser::new("ada", "ada@example.com")).await.unwrap();
    let task = tasks.create(NewTask::new(owner.id, "write report")).await.unwrap();
    let done = tasks.update(&task, Task::completion_patch(Utc::now())).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(tasks.delete(&task.id).await.unwrap());
    assert!(!tasks.delete(&task.id).await.unwrap());

    let records = sink.records();
    let actions: Vec<_> = records.iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::Create, AuditAction::Create, AuditAction::Update, AuditAction::Delete]
    );
    let update = &records[2];
    assert_eq!(update.entity, "tasks");
    assert!(update.changed_fields().contains(&"status"));
    assert_eq!(update.old.as_ref().and_then(|r| r.get("status")).and_then(|v| v.as_str()), Some("pending"));

    let missing = tasks.update(&task, Patch::new().set("title", "gone")).await.unwrap_err();
    assert!(matches!(missing, RepositoryError::NotFound { .. }));
}

#[tokio::test]
async fn bulk_update_skips_missing_and_bulk_delete_counts() -> anyhow::Result<()> {
    let store = InMemoryStore::new();
    let (users, tasks) = repos(&store);
    let owner = users.create(NewUser::new("ada", "ada@example.com")).await?;
    seeded_tasks(&tasks, &owner, 0, 3).await;
    let all = tasks.get_multi(&QuerySpec::all(), Page::default(), &[]).await?;

    let ghost = taskhub_tasks::TaskId::new();
    let updated = tasks
        .bulk_update(vec![
            (all[0].id, Patch::new().set("title", "renamed")),
            (ghost, Patch::new().set("title", "nobody")),
        ])
        .await?;
    assert_eq!(updated.len(), 1);
    assert_eq!(tasks.require(&all[0].id).await?.title, "renamed");

    let bad = tasks
        .bulk_update(vec![(all[1].id, Patch::new().set("colour", "red"))])
        .await
        .unwrap_err();
    assert_eq!(bad.field(), Some("colour"));

    let deleted = tasks.bulk_delete(&[all[0].id, all[1].id, ghost]).await?;
    assert_eq!(deleted, 2);
    assert_eq!(store.row_count("tasks"), 1);
    Ok(())
}

#[tokio::test]
async fn transient_failures_retry_but_constraint_violations_do_not() {
    let store = InMemoryStore::new();
    let (users, _) = repos(&store);

    store.inject_faults([StoreError::Unavailable("connection reset".into())]);
    let ada = users.create(NewUser::new("ada", "ada@example.com")).await.unwrap();
    assert!(users.exists(&ada.id).await.unwrap());

    let before = store.stats();
    let err = users.create(NewUser::new("ada", "other@example.com")).await.unwrap_err();
    assert_eq!(err.field(), Some("username"));
    let after = store.stats();
    assert_eq!(after.begun - before.begun, 1);
    assert_eq!(after.rolled_back - before.rolled_back, 1);

    store.inject_faults((0..3).map(|_| StoreError::Timeout("slow".into())));
    let err = users.count(&QuerySpec::all()).await.unwrap_err();
    assert!(matches!(err, RepositoryError::TransientStore(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn cached_reads_hit_until_invalidated_by_writes() {
    let store = InMemoryStore::new();
    let cache = Arc::new(InMemoryCache::new());
    let users: Repository<User, _> =
        Repository::new(store.clone()).with_cache(cache.clone(), Some(Duration::from_secs(60)));

    users.create(NewUser::new("ada", "ada@example.com")).await.unwrap();
    let spec = QuerySpec::<User>::builder().filter("username", FilterOp::Like, "a%").build().unwrap();

    assert_eq!(users.count_cached(&spec).await.unwrap(), 1);
    let begun = store.stats().begun;
    assert_eq!(users.count_cached(&spec).await.unwrap(), 1);
    assert_eq!(store.stats().begun, begun, "second read served from cache");
    assert!(!cache.is_empty());

    users.create(NewUser::new("alan", "alan@example.com")).await.unwrap();
    assert_eq!(users.count_cached(&spec).await.unwrap(), 2);

    let listed = users.get_multi_cached(&spec, Page::default(), &[]).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(users.invalidate_cached_reads() >= 1);
    assert!(cache.get("users:nothing").is_none());
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Property: get_multi returns at most `limit` rows, all matching the
    /// filter, ordered by the sort key.
    #[test]
    fn get_multi_is_filtered_sorted_and_bounded(
        hours in prop::collection::vec(0i64..500, 0..40),
        done in prop::collection::vec(any::<bool>(), 40),
        skip in 0u64..10,
        limit in 1u64..15,
        ascending in any::<bool>(),
    ) {
        let (page, expected_matches) = block_on(async {
            let store = InMemoryStore::new();
            let (users, tasks) = repos(&store);
            let owner = users.create(NewUser::new("p", "p@example.com")).await.unwrap();
            let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

            let inputs: Vec<_> = hours
                .iter()
                .zip(&done)
                .map(|(h, d)| {
                    let status = if *d { TaskStatus::Completed } else { TaskStatus::Pending };
                    NewTask::new(owner.id, "t").with_status(status).created_at(base + chrono::Duration::hours(*h))
                })
                .collect();
            let matches = inputs.iter().filter(|t| t.status == TaskStatus::Completed).count();
            tasks.bulk_create(inputs).await.unwrap();

            let spec = QuerySpec::<Task>::builder()
                .eq("status", TaskStatus::Completed)
                .order_by("created_at", ascending)
                .build()
                .unwrap();
            (tasks.get_multi(&spec, Page::new(skip, limit).unwrap(), &[]).await.unwrap(), matches)
        });

        let expected_len = expected_matches.saturating_sub(skip as usize).min(limit as usize);
        prop_assert_eq!(page.len(), expected_len);
        prop_assert!(page.iter().all(|t| t.status == TaskStatus::Completed));
        for pair in page.windows(2) {
            if ascending {
                prop_assert!(pair[0].created_at <= pair[1].created_at);
            } else {
                prop_assert!(pair[0].created_at >= pair[1].created_at);
            }
        }
    }
}

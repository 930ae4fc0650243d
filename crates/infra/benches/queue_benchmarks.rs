use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};

use taskhub_core::{Page, QuerySpec};
use taskhub_infra::cache::{Cache, CacheExt, InMemoryCache, cache_key};
use taskhub_infra::jobs::{
    EnqueueOptions, HandlerError, InMemoryJobStore, Job, JobQueue, JobQueueConfig, JobStore,
};
use taskhub_infra::repository::{InMemoryStore, Repository};
use taskhub_infra::retry::RetryConfig;
use taskhub_tasks::{NewTask, NewUser, Task, TaskStatus, User};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn bench_job_store_claims(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_store_push_claim");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::new("push_then_drain", batch_size), batch_size, |b, &size| {
            b.iter(|| {
                let store = InMemoryJobStore::new();
                for i in 0..size {
                    let options = EnqueueOptions::default().with_priority((i % 5) as i32);
                    store
                        .push(Job::new("bench", vec![json!(i)], Map::new(), options), None)
                        .unwrap();
                }
                let mut claimed = 0;
                while let Some(job) = store.claim_next(Utc::now()) {
                    claimed += 1;
                    black_box(job);
                }
                assert_eq!(claimed, size);
            });
        });
    }

    group.finish();
}

fn bench_queue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_queue_throughput");
    group.sample_size(20);
    let rt = runtime();

    for workers in [1usize, 4, 8].iter() {
        group.throughput(Throughput::Elements(200));
        group.bench_with_input(BenchmarkId::new("workers", workers), workers, |b, &workers| {
            b.iter(|| {
                rt.block_on(async {
                    let queue = JobQueue::new(
                        JobQueueConfig::default()
                            .with_poll_interval(Duration::from_millis(1))
                            .with_retry(RetryConfig::no_retry()),
                    );
                    queue
                        .register_fn("noop", |ctx| async move {
                            Ok::<_, HandlerError>(ctx.arg(0).cloned().unwrap_or(Value::Null))
                        })
                        .unwrap();
                    queue.start(workers);

                    let ids: Vec<_> = (0..200)
                        .map(|i| {
                            queue
                                .enqueue("noop", vec![json!(i)], Map::new(), EnqueueOptions::default())
                                .unwrap()
                        })
                        .collect();
                    for id in ids {
                        black_box(queue.wait_for(id, Duration::from_secs(30)).await);
                    }
                    queue.stop().await;
                })
            });
        });
    }

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");
    let cache = Arc::new(InMemoryCache::new());
    let args = (json!({"field": "status", "op": "EQ", "value": "completed"}), Page::default());

    group.bench_function("cache_key", |b| {
        b.iter(|| cache_key("tasks", "get_multi", black_box(&args)).unwrap());
    });

    let key = cache_key("tasks", "get_multi", &args).unwrap();
    cache
        .set_serialized(&key, &vec![1u32; 64], Some(Duration::from_secs(60)))
        .unwrap();
    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(cache.get(&key)));
    });
    group.bench_function("get_as_hit", |b| {
        b.iter(|| black_box(cache.get_as::<Vec<u32>>(&key)));
    });

    group.finish();
}

fn bench_get_multi(c: &mut Criterion) {
    let mut group = c.benchmark_group("repository_get_multi");
    let rt = runtime();

    for rows in [100usize, 1000, 5000].iter() {
        let store = InMemoryStore::new();
        let users: Repository<User, _> = Repository::new(store.clone());
        let tasks: Repository<Task, _> = Repository::new(store.clone());
        rt.block_on(async {
            let owner = users.create(NewUser::new("bench", "bench@example.com")).await.unwrap();
            let inputs = (0..*rows)
                .map(|i| {
                    let status = if i % 4 == 0 { TaskStatus::Pending } else { TaskStatus::Completed };
                    NewTask::new(owner.id, format!("task {i}"))
                        .with_status(status)
                        .created_at(Utc::now() - chrono::Duration::minutes(i as i64))
                })
                .collect();
            tasks.bulk_create(inputs).await.unwrap();
        });

        let spec = QuerySpec::<Task>::builder()
            .eq("status", TaskStatus::Completed)
            .order_by("created_at", false)
            .build()
            .unwrap();

        group.throughput(Throughput::Elements(*rows as u64));
        group.bench_with_input(BenchmarkId::new("filter_sort_limit", rows), rows, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(tasks.get_multi(&spec, Page::new(0, 10).unwrap(), &[]).await.unwrap())
                })
            });
        });
        group.bench_with_input(BenchmarkId::new("with_eager_user", rows), rows, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(tasks.get_multi(&spec, Page::new(0, 10).unwrap(), &["user"]).await.unwrap())
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_job_store_claims,
    bench_queue_throughput,
    bench_cache,
    bench_get_multi
);
criterion_main!(benches);

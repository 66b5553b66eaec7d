//! Redis storage integration tests.
//!
//! These exercise the storage contract against a live Redis. Run with:
//! `cargo test -p forq-queue -- --ignored --test-threads=1`

use std::time::Duration;

use serde_json::{json, Value};

use forq_models::{unix_time, Job};
use forq_queue::{RedisClient, RedisConfig};

async fn client() -> RedisClient {
    dotenvy::dotenv().ok();
    RedisClient::connect(RedisConfig::from_env())
        .await
        .expect("Failed to connect to Redis")
}

async fn raw() -> redis::aio::MultiplexedConnection {
    dotenvy::dotenv().ok();
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    redis::Client::open(url.as_str())
        .expect("Failed to open Redis client")
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis")
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn enqueue_lands_at_queue_head() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    let before = unix_time();
    let job = Job::new("HardWorker").with_args(vec![json!(1), json!(2)]);
    let stored = client.enqueue(job).await.expect("enqueue");
    assert_eq!(stored.jid.len(), 24);

    let mut conn = raw().await;
    let head: String = redis::cmd("LINDEX")
        .arg("queue:default")
        .arg(0)
        .query_async(&mut conn)
        .await
        .expect("lindex");
    let value: Value = serde_json::from_str(&head).expect("payload is JSON");

    assert_eq!(value["class"], json!("HardWorker"));
    assert_eq!(value["args"], json!([1, 2]));
    assert_eq!(value["queue"], json!("default"));
    assert_eq!(value["retry"], json!(true));
    assert_eq!(value["jid"], json!(stored.jid));
    assert!(value.get("retry_count").is_none());

    let created = value["created_at"].as_f64().expect("created_at");
    assert!(created >= before - 1.0 && created <= unix_time() + 1.0);

    let queues = client.known_queues().await.expect("known queues");
    assert_eq!(queues, vec!["default".to_string()]);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn delayed_enqueue_goes_to_schedule_set() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    let now = unix_time();
    let stored = client
        .enqueue_in(Job::new("W").with_queue("delayed_q"), Duration::from_secs(60))
        .await
        .expect("enqueue_in");

    assert_eq!(client.queue_size("delayed_q").await.expect("llen"), 0);
    assert_eq!(client.scheduled_size("schedule").await.expect("zcard"), 1);

    let mut conn = raw().await;
    let members: Vec<String> = redis::cmd("ZRANGE")
        .arg("schedule")
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .expect("zrange");
    let score: f64 = redis::cmd("ZSCORE")
        .arg("schedule")
        .arg(&members[0])
        .query_async(&mut conn)
        .await
        .expect("zscore");
    assert!((score - (now + 60.0)).abs() < 2.0);
    assert!((stored.at.expect("at") - (now + 60.0)).abs() < 2.0);

    // at-most-one-of validation
    let already_scheduled = Job::new("W").with_at(now + 10.0);
    assert!(client
        .enqueue_in(already_scheduled, Duration::from_secs(5))
        .await
        .is_err());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn deschedule_moves_due_entries() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    let due = unix_time() + 50.0;
    client
        .enqueue_at(Job::new("W").with_queue("sched_q"), due)
        .await
        .expect("enqueue_at");
    assert_eq!(client.queue_size("sched_q").await.expect("llen"), 0);

    // not yet due
    assert_eq!(client.deschedule("schedule", due - 1.0).await.expect("tick"), 0);

    let moved = client.deschedule("schedule", due + 1.0).await.expect("tick");
    assert_eq!(moved, 1);
    assert_eq!(client.scheduled_size("schedule").await.expect("zcard"), 0);
    assert_eq!(client.queue_size("sched_q").await.expect("llen"), 1);

    let mut conn = raw().await;
    let head: String = redis::cmd("LINDEX")
        .arg("queue:sched_q")
        .arg(0)
        .query_async(&mut conn)
        .await
        .expect("lindex");
    assert_eq!(Job::decode(&head).expect("decode").class, "W");

    let queues = client.known_queues().await.expect("known queues");
    assert!(queues.contains(&"sched_q".to_string()));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn dequeue_tracks_backup_until_acknowledged() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    client
        .enqueue(Job::new("W").with_queue("work_q"))
        .await
        .expect("enqueue");

    let fetched = client.dequeue("work_q", 5, "node-a").await.expect("dequeue");
    assert_eq!(fetched.len(), 1);
    assert_eq!(client.queue_size("work_q").await.expect("llen"), 0);
    assert_eq!(client.backup_size("work_q", "node-a").await.expect("llen"), 1);

    assert!(client
        .acknowledge("work_q", "node-a", &fetched[0])
        .await
        .expect("acknowledge"));
    assert_eq!(client.backup_size("work_q", "node-a").await.expect("llen"), 0);

    // acknowledging twice is a no-op
    assert!(!client
        .acknowledge("work_q", "node-a", &fetched[0])
        .await
        .expect("acknowledge"));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn resurrect_preserves_fetch_order() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    let first = client
        .enqueue(Job::new("W").with_queue("boot_q").with_args(vec![json!("first")]))
        .await
        .expect("enqueue");
    client
        .enqueue(Job::new("W").with_queue("boot_q").with_args(vec![json!("second")]))
        .await
        .expect("enqueue");

    let fetched = client.dequeue("boot_q", 2, "node-b").await.expect("dequeue");
    assert_eq!(fetched.len(), 2);
    assert_eq!(client.queue_size("boot_q").await.expect("llen"), 0);

    let restored = client.resurrect("boot_q", "node-b").await.expect("resurrect");
    assert_eq!(restored, 2);
    assert_eq!(client.backup_size("boot_q", "node-b").await.expect("llen"), 0);
    assert_eq!(client.queue_size("boot_q").await.expect("llen"), 2);

    // the senior job comes out first again
    let refetched = client.dequeue("boot_q", 1, "node-b").await.expect("dequeue");
    assert_eq!(Job::decode(&refetched[0]).expect("decode").jid, first.jid);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn unique_lock_suppresses_duplicate_enqueue() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    let template =
        || Job::new("W").with_queue("uniq_q").with_args(vec![json!(1)]).with_unique_for(60_000);

    let first = client.enqueue(template()).await.expect("enqueue");
    assert!(first.unlocks_at.is_some());

    let second = client.enqueue(template()).await.expect("enqueue");
    assert_eq!(second.jid, first.jid);
    assert_eq!(client.queue_size("uniq_q").await.expect("llen"), 1);

    let token = first.unique_token.clone().expect("token");
    let mut conn = raw().await;
    let ttl: i64 = redis::cmd("PTTL")
        .arg(format!("unique:{token}"))
        .query_async(&mut conn)
        .await
        .expect("pttl");
    assert!(ttl > 0 && ttl <= 60_000);

    assert!(client.unlock(&first).await.expect("unlock"));
    let gone: Option<String> = redis::cmd("GET")
        .arg(format!("unique:{token}"))
        .query_async(&mut conn)
        .await
        .expect("get");
    assert!(gone.is_none());
    assert!(!client.unlock(&first).await.expect("unlock"));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn unlock_never_releases_a_foreign_holder() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    let first = client
        .enqueue(Job::new("W").with_queue("uniq_q2").with_unique_for(60_000))
        .await
        .expect("enqueue");

    let mut impostor = Job::new("W").with_queue("uniq_q2");
    impostor.unique_token = first.unique_token.clone();
    assert!(!client.unlock(&impostor).await.expect("unlock"));

    let token = first.unique_token.clone().expect("token");
    let mut conn = raw().await;
    let holder: Option<String> = redis::cmd("GET")
        .arg(format!("unique:{token}"))
        .query_async(&mut conn)
        .await
        .expect("get");
    assert_eq!(holder.as_deref(), Some(first.jid.as_str()));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn retry_scores_by_due_time() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    let mut job = Job::new("W");
    job.retry_count = 1;
    job.at = Some(unix_time() + 30.0);
    client.retry(&job).await.expect("retry");

    assert_eq!(client.scheduled_size("retry").await.expect("zcard"), 1);

    let mut conn = raw().await;
    let members: Vec<String> = redis::cmd("ZRANGE")
        .arg("retry")
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .expect("zrange");
    let score: f64 = redis::cmd("ZSCORE")
        .arg("retry")
        .arg(&members[0])
        .query_async(&mut conn)
        .await
        .expect("zscore");
    assert!((score - job.at.expect("at")).abs() < 0.001);

    // a job without a due time is rejected
    assert!(client.retry(&Job::new("W")).await.is_err());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn clear_all_removes_every_engine_key() {
    let client = client().await;
    client.clear_all().await.expect("clear");

    let locked = client
        .enqueue(Job::new("W").with_queue("clear_q").with_unique_for(60_000))
        .await
        .expect("enqueue");
    client
        .enqueue_in(Job::new("W").with_queue("clear_q"), Duration::from_secs(120))
        .await
        .expect("enqueue_in");
    client
        .enqueue(Job::new("W").with_queue("clear_q"))
        .await
        .expect("enqueue");
    client.dequeue("clear_q", 1, "node-c").await.expect("dequeue");

    client.clear_all().await.expect("clear_all");

    assert!(client.known_queues().await.expect("queues").is_empty());
    assert_eq!(client.queue_size("clear_q").await.expect("llen"), 0);
    assert_eq!(client.backup_size("clear_q", "node-c").await.expect("llen"), 0);
    assert_eq!(client.scheduled_size("schedule").await.expect("zcard"), 0);

    let token = locked.unique_token.expect("token");
    let mut conn = raw().await;
    let lock: Option<String> = redis::cmd("GET")
        .arg(format!("unique:{token}"))
        .query_async(&mut conn)
        .await
        .expect("get");
    assert!(lock.is_none());
}

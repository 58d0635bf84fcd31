//! Session pool behavior: domain reuse, creation serialization, slot
//! bounding, and idempotent shutdown.

use std::sync::Arc;
use std::time::Duration;

use courier_core::backend::BrowserBackend;
use courier_core::backend::mock::MockBrowser;
use courier_core::session::SessionPool;

fn mock_pool(max_sessions: usize) -> SessionPool {
    let browser: Arc<dyn BrowserBackend> = Arc::new(MockBrowser::new());
    SessionPool::new(browser, max_sessions)
}

#[tokio::test]
async fn same_domain_reuses_one_session() {
    let pool = mock_pool(3);

    let first = pool.acquire("https://www.amazon.com").await.unwrap();
    pool.release("https://www.amazon.com");
    let second = pool.acquire("https://www.amazon.com/s?k=laptop").await.unwrap();
    pool.release("https://www.amazon.com/s?k=laptop");

    assert_eq!(first.id, second.id);
    assert_eq!(pool.active_count(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn different_domains_get_different_sessions() {
    let pool = mock_pool(3);

    let a = pool.acquire("https://www.amazon.com").await.unwrap();
    let b = pool.acquire("https://www.bestbuy.com").await.unwrap();
    pool.release("https://www.amazon.com");
    pool.release("https://www.bestbuy.com");

    assert_ne!(a.id, b.id);
    assert_eq!(pool.active_count(), 2);
    let mut domains = pool.session_domains();
    domains.sort();
    assert_eq!(domains, vec!["www.amazon.com", "www.bestbuy.com"]);

    pool.shutdown().await;
}

#[tokio::test]
async fn concurrent_acquires_create_exactly_one_session() {
    let pool = Arc::new(mock_pool(3));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let session = pool.acquire("https://www.amazon.com").await;
            pool.release("https://www.amazon.com");
            session.unwrap().id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    ids.dedup();
    assert_eq!(ids.len(), 1, "all acquirers must share one session");
    assert_eq!(pool.active_count(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn pool_blocks_when_full_until_release() {
    let pool = Arc::new(mock_pool(1));

    let _first = pool.acquire("https://www.amazon.com").await.unwrap();

    // A second acquire for a different domain must block on the slot.
    let blocked = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let session = pool.acquire("https://www.bestbuy.com").await;
            pool.release("https://www.bestbuy.com");
            session
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "acquire should wait for a free slot");

    pool.release("https://www.amazon.com");
    let session = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("blocked acquire must resume after release")
        .unwrap();
    assert!(session.is_some());

    pool.shutdown().await;
}

#[tokio::test]
async fn peek_finds_existing_without_blocking() {
    let pool = mock_pool(1);

    assert!(pool.peek("https://www.amazon.com").is_none());

    let session = pool.acquire("https://www.amazon.com").await.unwrap();
    // Slot still held; peek must not care.
    let peeked = pool.peek("https://www.amazon.com").unwrap();
    assert_eq!(peeked.id, session.id);
    assert!(pool.peek("https://www.bestbuy.com").is_none());

    pool.release("https://www.amazon.com");
    pool.shutdown().await;
}

#[tokio::test]
async fn unconfigured_backend_yields_no_session() {
    let browser: Arc<dyn BrowserBackend> = Arc::new(MockBrowser::unconfigured());
    let pool = SessionPool::new(browser, 2);

    let session = pool.acquire("https://www.amazon.com").await;
    pool.release("https://www.amazon.com");

    assert!(session.is_none());
    assert_eq!(pool.active_count(), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let pool = mock_pool(2);

    pool.acquire("https://www.amazon.com").await.unwrap();
    pool.release("https://www.amazon.com");
    assert_eq!(pool.active_count(), 1);

    pool.shutdown().await;
    assert_eq!(pool.active_count(), 0);

    // Second (and third) shutdown are no-ops.
    pool.shutdown().await;
    pool.shutdown().await;
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn pool_usable_after_shutdown_for_new_sessions() {
    // Shutdown closes sessions but the pool itself keeps functioning; the
    // driver only shuts down at task end, after which the pool is dropped.
    let pool = mock_pool(2);
    pool.acquire("https://www.amazon.com").await.unwrap();
    pool.release("https://www.amazon.com");
    pool.shutdown().await;

    let session = pool.acquire("https://www.amazon.com").await;
    pool.release("https://www.amazon.com");
    assert!(session.is_some());
    pool.shutdown().await;
}

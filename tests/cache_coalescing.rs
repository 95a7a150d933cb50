//! The coalescing scenario: simultaneous requests for one slow resource
//! trigger exactly one production, and later requests inside the lifetime
//! are served without another.
//!
//! The fetch path below is the same shape the file handler uses:
//! `get_notified` first, then reserve-produce-add, inheriting production
//! on a handoff.

use bytes::Bytes;
use fyr::cache::{Lookup, Notified};
use fyr::{Artifact, Cache, CacheKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{sleep, Duration};

async fn produce(cache: &Cache, key: &CacheKey, productions: &AtomicUsize) -> Bytes {
    cache.loading(key);
    productions.fetch_add(1, Ordering::SeqCst);
    // The slow part: reading the file takes a while.
    sleep(Duration::from_millis(100)).await;
    let artifact = Artifact::new(
        20,
        "text/gemini",
        Bytes::from_static(b"# slow\n"),
        Duration::from_secs(60),
    );
    let body = artifact.body.clone();
    cache.add(key, artifact);
    body
}

async fn fetch(cache: &Cache, key: &CacheKey, productions: &AtomicUsize) -> Bytes {
    match cache.get_notified(key) {
        Lookup::Ready(artifact) => artifact.body.clone(),
        Lookup::Waiting(subscription) => match subscription.wait().await {
            Notified::Ready(artifact) => artifact.body.clone(),
            Notified::Produce => produce(cache, key, productions).await,
        },
        Lookup::Absent => produce(cache, key, productions).await,
    }
}

#[tokio::test]
async fn three_simultaneous_requests_share_one_production() {
    let cache = Cache::new(0);
    let key = CacheKey::new(1, "localhost:1965/slow.gmi");
    let productions = AtomicUsize::new(0);

    let (a, b, c) = tokio::join!(
        fetch(&cache, &key, &productions),
        fetch(&cache, &key, &productions),
        fetch(&cache, &key, &productions),
    );

    assert_eq!(productions.load(Ordering::SeqCst), 1);
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(a.as_ref(), b"# slow\n");

    // Within the lifetime, nothing is produced again.
    let again = fetch(&cache, &key, &productions).await;
    assert_eq!(again, a);
    assert_eq!(productions.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn expiry_forces_a_new_production() {
    let cache = Cache::new(0);
    let key = CacheKey::new(1, "localhost:1965/slow.gmi");
    let productions = AtomicUsize::new(0);

    fetch(&cache, &key, &productions).await;
    assert_eq!(productions.load(Ordering::SeqCst), 1);

    sleep(Duration::from_secs(61)).await;
    fetch(&cache, &key, &productions).await;
    assert_eq!(productions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelled_production_hands_off_to_a_waiter() {
    let cache = Cache::new(0);
    let key = CacheKey::new(1, "k");
    let productions = AtomicUsize::new(0);

    // A producer reserves, a second request subscribes, then the producer
    // gives up (its client crashed).
    cache.loading(&key);
    let waiter = fetch(&cache, &key, &productions);
    let canceller = async {
        sleep(Duration::from_millis(10)).await;
        cache.cancel(&key);
    };
    let (body, ()) = tokio::join!(waiter, canceller);

    // The waiter inherited production and completed it itself.
    assert_eq!(productions.load(Ordering::SeqCst), 1);
    assert_eq!(body.as_ref(), b"# slow\n");
    assert!(cache.is_loaded(&key));
}

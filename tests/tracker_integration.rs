//! Integration tests for the visit upsert engine
//!
//! Every test runs against a fresh in-memory SQLite store.

use std::sync::Arc;
use visitrack::models::VisitableCounters;
use visitrack::storage::{SqliteStore, VisitScope, VisitStore};
use visitrack::{
    EntityRef, Identifiers, Registry, VisitError, VisitTracker, VisitableOptions, VisitorKey,
};

/// Helper to create SQLite test storage
async fn create_sqlite_store(extra_columns: Vec<String>) -> Arc<dyn VisitStore> {
    let store = SqliteStore::new("sqlite::memory:", 5, extra_columns)
        .await
        .unwrap();
    store.init().await.unwrap();
    Arc::new(store)
}

fn create_registry() -> Registry {
    Registry::builder()
        .visitor_type("user")
        .visitor_type("account")
        .visitable(
            VisitableOptions::new("post")
                .by(["users"])
                .accept_ip(true)
                .counter_cache(true)
                .extra_column("referrer"),
        )
        .visitable(VisitableOptions::new("article").by(["users"]))
        .visitable(VisitableOptions::new("page").accept_ip(true))
        .build()
        .unwrap()
}

async fn create_tracker() -> Arc<VisitTracker> {
    let registry = Arc::new(create_registry());
    let store = create_sqlite_store(registry.extra_columns()).await;
    Arc::new(VisitTracker::new(store, registry))
}

fn user(id: i64) -> EntityRef {
    EntityRef::new("user", id)
}

#[tokio::test]
async fn test_ip_then_user_visits_accumulate() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();
    post.created().await.unwrap();

    post.visit(&Identifiers::ip("128.0.0.0")).await.unwrap();
    post.visit(&Identifiers::ip("128.0.0.1")).await.unwrap();
    post.visit(&Identifiers::ip("128.0.0.1")).await.unwrap();

    assert_eq!(post.unique_visits(false).await.unwrap(), 2);
    assert_eq!(post.total_visits(false).await.unwrap(), 3);

    post.visit(&Identifiers::user(user(2))).await.unwrap();
    post.visit(&Identifiers::user(user(3))).await.unwrap();
    post.visit(&Identifiers::user(user(3))).await.unwrap();

    // Two IPs plus two users: four distinct pairings.
    assert_eq!(post.unique_visits(false).await.unwrap(), 4);
    assert_eq!(post.total_visits(false).await.unwrap(), 6);
    assert_eq!(post.unique_visits(true).await.unwrap(), 4);
    assert_eq!(post.total_visits(true).await.unwrap(), 6);
    assert_eq!(post.number_of_visitors().await.unwrap(), 4);
    assert_eq!(post.number_of_visits().await.unwrap(), 6);
}

#[tokio::test]
async fn test_repeat_visits_share_one_row() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();

    let first = post.visit(&Identifiers::by(user(7))).await.unwrap();
    assert_eq!(first.count, 1);

    let mut last = first.clone();
    for _ in 0..4 {
        last = post.visit(&Identifiers::visitor(user(7))).await.unwrap();
    }

    assert_eq!(last.id, first.id);
    assert_eq!(last.count, 5);
    assert_eq!(last.first_visited_at(), first.created_at);
    assert!(last.last_visited_at() >= first.last_visited_at());

    let rows = post.visits(VisitScope::new()).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_bare_ids_in_user_and_account_slots() {
    let tracker = create_tracker().await;
    let page = tracker.visitable(EntityRef::new("page", 1)).unwrap();

    let by_user = page.visit(&Identifiers::user(4_i64)).await.unwrap();
    let by_account = page.visit(&Identifiers::account(4_i64)).await.unwrap();

    assert_eq!(by_user.visitor, VisitorKey::identified(EntityRef::new("user", 4)));
    assert_eq!(by_account.visitor, VisitorKey::identified(EntityRef::new("account", 4)));
    assert_ne!(by_user.id, by_account.id);
    assert_eq!(page.unique_visits(false).await.unwrap(), 2);
}

#[tokio::test]
async fn test_visited_by() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();

    assert!(!post.is_visited().await.unwrap());

    post.visit(&Identifiers::user(user(2))).await.unwrap();

    assert!(post.is_visited().await.unwrap());
    assert!(post.is_visited_by(&Identifiers::user(user(2))).await.unwrap());
    assert!(!post.is_visited_by(&Identifiers::user(user(9))).await.unwrap());

    let visit = post.visit_by(&Identifiers::user(user(2))).await.unwrap();
    assert_eq!(visit.map(|v| v.count), Some(1));
    assert!(post.visit_by(&Identifiers::ip("10.0.0.1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_visited_by_does_not_write() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();

    post.is_visited_by(&Identifiers::user(user(2))).await.unwrap();
    assert_eq!(post.unique_visits(true).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reset_visits() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();
    let other = tracker.visitable(EntityRef::new("post", 2)).unwrap();

    post.visit(&Identifiers::ip("128.0.0.1")).await.unwrap();
    post.visit(&Identifiers::user(user(2))).await.unwrap();
    other.visit(&Identifiers::user(user(2))).await.unwrap();

    post.reset_visits().await.unwrap();

    assert_eq!(post.total_visits(false).await.unwrap(), 0);
    assert_eq!(post.unique_visits(false).await.unwrap(), 0);
    assert_eq!(post.total_visits(true).await.unwrap(), 0);
    assert!(post.visits(VisitScope::new()).await.unwrap().is_empty());

    // Other visitables are untouched.
    assert_eq!(other.total_visits(true).await.unwrap(), 1);

    // Visiting again starts from scratch.
    let visit = post.visit(&Identifiers::user(user(2))).await.unwrap();
    assert_eq!(visit.count, 1);
    assert_eq!(post.unique_visits(false).await.unwrap(), 1);
}

#[tokio::test]
async fn test_ip_rejected_when_not_accepted() {
    let tracker = create_tracker().await;
    let article = tracker.visitable(EntityRef::new("article", 1)).unwrap();

    let err = article
        .visit(&Identifiers::ip("128.0.0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, VisitError::InvalidVisitor(_)));

    assert_eq!(article.unique_visits(true).await.unwrap(), 0);
    assert!(article.visits(VisitScope::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_visitors() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();

    let cases = vec![
        Identifiers::default(),
        Identifiers::ip("   "),
        Identifiers::by("not an ip"),
        Identifiers::by(EntityRef::new("robot", 1)),
        // Registered visitor type, but post only accepts users
        Identifiers::account(EntityRef::new("account", 1)),
        // A bare id does not say which type it is
        Identifiers::by(3_i64),
    ];

    for identifiers in cases {
        let err = post.visit(&identifiers).await.unwrap_err();
        assert!(err.is_invalid_visitor(), "{identifiers:?} gave {err:?}");
    }

    assert_eq!(post.total_visits(true).await.unwrap(), 0);
}

#[tokio::test]
async fn test_precedence_first_slot_wins() {
    let tracker = create_tracker().await;
    let page = tracker.visitable(EntityRef::new("page", 1)).unwrap();

    let identifiers = Identifiers {
        user: Some(user(5).into()),
        ip: Some("10.1.1.1".into()),
        ..Identifiers::default()
    };
    let visit = page.visit(&identifiers).await.unwrap();
    assert_eq!(visit.visitor, VisitorKey::identified(user(5)));

    // A blank `by` falls through to the next slot.
    let identifiers = Identifiers {
        by: Some("  ".into()),
        ip: Some(" 10.1.1.1 ".into()),
        ..Identifiers::default()
    };
    let visit = page.visit(&identifiers).await.unwrap();
    assert_eq!(visit.visitor, VisitorKey::anonymous("10.1.1.1"));
}

#[tokio::test]
async fn test_unknown_visitable_type() {
    let tracker = create_tracker().await;

    let err = tracker
        .visitable(EntityRef::new("comment", 1))
        .err()
        .unwrap();
    assert!(matches!(err, VisitError::InvalidConfigValue(_)));
    assert!(!tracker.registry().is_visitable("comment"));
    assert!(tracker.registry().is_visitable("post"));
}

#[tokio::test]
async fn test_forced_totals_match_cached() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 3)).unwrap();
    post.created().await.unwrap();

    for i in 0..5 {
        post.visit(&Identifiers::user(user(i % 3))).await.unwrap();
        post.visit(&Identifiers::ip(format!("10.0.0.{i}"))).await.unwrap();

        assert_eq!(
            post.total_visits(false).await.unwrap(),
            post.total_visits(true).await.unwrap()
        );
        assert_eq!(
            post.unique_visits(false).await.unwrap(),
            post.unique_visits(true).await.unwrap()
        );
    }
}

#[tokio::test]
async fn test_uninitialized_counters_fall_back_to_recount() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();

    // No `created()` call: the counters row does not exist yet.
    assert_eq!(tracker.store().load_counters(post.entity()).await.unwrap(), None);

    post.visit(&Identifiers::user(user(1))).await.unwrap();
    post.visit(&Identifiers::user(user(1))).await.unwrap();
    post.visit(&Identifiers::user(user(2))).await.unwrap();

    let cached = tracker.store().load_counters(post.entity()).await.unwrap();
    assert_eq!(
        cached,
        Some(VisitableCounters {
            total_visits: 3,
            unique_visitors: 2,
        })
    );
}

#[tokio::test]
async fn test_recount_repairs_drift() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();
    post.created().await.unwrap();

    post.visit(&Identifiers::user(user(1))).await.unwrap();
    post.visit(&Identifiers::ip("10.0.0.1")).await.unwrap();

    tracker
        .store()
        .write_counters(
            post.entity(),
            VisitableCounters {
                total_visits: 40,
                unique_visitors: 17,
            },
        )
        .await
        .unwrap();
    assert_eq!(post.total_visits(false).await.unwrap(), 40);

    let counters = post.recount().await.unwrap();
    assert_eq!(counters.total_visits, 2);
    assert_eq!(counters.unique_visitors, 2);
    assert_eq!(post.total_visits(false).await.unwrap(), 2);
    assert_eq!(post.unique_visits(false).await.unwrap(), 2);
}

#[tokio::test]
async fn test_no_counter_cache_always_recomputes() {
    let tracker = create_tracker().await;
    let page = tracker.visitable(EntityRef::new("page", 1)).unwrap();
    page.created().await.unwrap();

    page.visit(&Identifiers::ip("10.0.0.1")).await.unwrap();

    assert_eq!(tracker.store().load_counters(page.entity()).await.unwrap(), None);
    assert_eq!(page.total_visits(false).await.unwrap(), 1);
}

#[tokio::test]
async fn test_custom_attributes() {
    let tracker = create_tracker().await;
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();

    let identifiers = Identifiers::user(user(1))
        .with_attribute("referrer", "https://news.example")
        .with_attribute("ip", "1.2.3.4")
        .with_attribute("visits", "100")
        .with_attribute("campaign", "spring");
    let visit = post.visit(&identifiers).await.unwrap();

    assert_eq!(visit.count, 1);
    assert_eq!(visit.visitor, VisitorKey::identified(user(1)));
    assert_eq!(
        visit.attributes.get("referrer").map(String::as_str),
        Some("https://news.example")
    );
    assert!(!visit.attributes.contains_key("campaign"));

    let visit = post
        .visit(&Identifiers::user(user(1)).with_attribute("referrer", "https://search.example"))
        .await
        .unwrap();
    assert_eq!(visit.count, 2);
    assert_eq!(
        visit.attributes.get("referrer").map(String::as_str),
        Some("https://search.example")
    );

    // Omitted attributes keep their stored value.
    let visit = post.visit(&Identifiers::user(user(1))).await.unwrap();
    assert_eq!(
        visit.attributes.get("referrer").map(String::as_str),
        Some("https://search.example")
    );
}

#[tokio::test]
async fn test_visitor_side_accessors() {
    let tracker = create_tracker().await;
    let first = tracker.visitable(EntityRef::new("post", 1)).unwrap();
    let second = tracker.visitable(EntityRef::new("article", 2)).unwrap();

    first.visit(&Identifiers::user(user(1))).await.unwrap();
    second.visit(&Identifiers::user(user(1))).await.unwrap();
    second.visit(&Identifiers::user(user(1))).await.unwrap();
    first.visit(&Identifiers::user(user(2))).await.unwrap();
    first.visit(&Identifiers::ip("10.0.0.9")).await.unwrap();

    let visitor = tracker.visitor(user(1)).unwrap();
    assert_eq!(
        visitor.visitables().await.unwrap(),
        vec![EntityRef::new("post", 1), EntityRef::new("article", 2)]
    );

    let visits = visitor
        .visits(VisitScope::new().of_visitable_type("article"))
        .await
        .unwrap();
    assert_eq!(visits.len(), 1);
    assert_eq!(visits[0].count, 2);

    assert_eq!(
        first.visitors().await.unwrap(),
        vec![
            VisitorKey::identified(user(1)),
            VisitorKey::identified(user(2)),
            VisitorKey::anonymous("10.0.0.9"),
        ]
    );

    assert!(matches!(
        tracker.visitor(EntityRef::new("robot", 1)),
        Err(VisitError::InvalidConfigValue(_))
    ));
}

#[tokio::test]
async fn test_ipv6_visitors() {
    let tracker = create_tracker().await;
    let page = tracker.visitable(EntityRef::new("page", 1)).unwrap();

    let visit = page.visit(&Identifiers::ip("2001:db8::1")).await.unwrap();
    assert_eq!(visit.visitor, VisitorKey::anonymous("2001:db8::1"));

    // Same address written differently is the same visitor.
    let visit = page
        .visit(&Identifiers::ip("2001:0db8:0000:0000:0000:0000:0000:0001"))
        .await
        .unwrap();
    assert_eq!(visit.count, 2);

    // Canonical form does not fit the ip column.
    let err = page
        .visit(&Identifiers::ip("2001:db8:1234:5678:9abc:def0:1234:5678"))
        .await
        .unwrap_err();
    assert!(err.is_invalid_visitor());
}

#[tokio::test]
async fn test_concurrent_visits_same_visitor() {
    let tracker = create_tracker().await;
    let post = EntityRef::new("post", 1);
    tracker.visitable(post.clone()).unwrap().created().await.unwrap();

    let mut handles = vec![];
    for _ in 0..20 {
        let tracker = Arc::clone(&tracker);
        let post = post.clone();
        handles.push(tokio::spawn(async move {
            tracker
                .visitable(post)?
                .visit(&Identifiers::user(EntityRef::new("user", 7)))
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let visitable = tracker.visitable(post).unwrap();
    let rows = visitable.visits(VisitScope::new()).await.unwrap();
    assert_eq!(rows.len(), 1, "Exactly one row per pairing");
    assert_eq!(rows[0].count, 20);

    assert_eq!(visitable.total_visits(false).await.unwrap(), 20);
    assert_eq!(visitable.unique_visits(false).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_visits_many_visitors() {
    let tracker = create_tracker().await;
    let post = EntityRef::new("post", 1);
    tracker.visitable(post.clone()).unwrap().created().await.unwrap();

    let mut handles = vec![];
    for i in 0..30 {
        let tracker = Arc::clone(&tracker);
        let post = post.clone();
        handles.push(tokio::spawn(async move {
            let ip = format!("192.0.2.{}", i % 10);
            tracker.visitable(post)?.visit(&Identifiers::ip(ip)).await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let visitable = tracker.visitable(post).unwrap();
    assert_eq!(visitable.unique_visits(true).await.unwrap(), 10);
    assert_eq!(visitable.total_visits(true).await.unwrap(), 30);
    assert_eq!(visitable.unique_visits(false).await.unwrap(), 10);
    assert_eq!(visitable.total_visits(false).await.unwrap(), 30);
}

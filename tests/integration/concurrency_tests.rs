//! Concurrency tests for the session store and channel bridge
//!
//! Runs on a multi-threaded runtime so associations, cascades and lookups
//! really interleave.

use futures::future::join_all;
use odmcp_auth::{AssociationOutcome, ChannelLookup};
use odmcp_tests::common::{context, direct_session};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_association_wins_under_contention() {
    let ctx = Arc::new(context());
    let channel = ctx.open_channel(None);

    let mut sessions = Vec::new();
    for i in 0..8 {
        sessions.push(direct_session(&ctx, &format!("user-{}", i), &["read"], None).await);
    }

    let attempts = sessions.iter().map(|session| {
        let ctx = Arc::clone(&ctx);
        let channel = channel.clone();
        let id = session.id.clone();
        tokio::spawn(async move { ctx.associate(&channel, &id).await })
    });
    let outcomes: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let winners = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, AssociationOutcome::Associated))
        .count();
    assert_eq!(winners, 1);

    let ChannelLookup::Resolved(resolved) = ctx.bridge().lookup(&channel).await else {
        panic!("channel should resolve to the winning session");
    };
    for outcome in &outcomes {
        if let AssociationOutcome::Kept { existing } = outcome {
            assert_eq!(existing, &resolved.id);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cascade_racing_associations_leaves_no_orphans() {
    let ctx = Arc::new(context());
    let session = direct_session(&ctx, "race", &["write"], None).await;
    let channels: Vec<_> = (0..16).map(|_| ctx.open_channel(None)).collect();

    let mut tasks = Vec::new();
    for channel in channels.clone() {
        let ctx = Arc::clone(&ctx);
        let id = session.id.clone();
        tasks.push(tokio::spawn(async move {
            // losing the race to the cascade is an acceptable outcome
            let _ = ctx.associate(&channel, &id).await;
        }));
    }
    {
        let ctx = Arc::clone(&ctx);
        let id = session.id.clone();
        tasks.push(tokio::spawn(async move {
            ctx.logout(&id).await;
        }));
    }

    tokio::time::timeout(Duration::from_secs(5), join_all(tasks))
        .await
        .expect("associate and cascade must not deadlock");

    assert!(ctx.store().get(&session.id).await.is_none());
    // every channel is either closed by the cascade or never got associated
    for channel in &channels {
        if ctx.bridge().channel(channel).is_some() {
            assert!(matches!(
                ctx.bridge().lookup(channel).await,
                ChannelLookup::Unassociated
            ));
        }
    }
    assert!(ctx
        .bridge()
        .channels_for_identity(&session.id)
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_get_distinct_sessions() {
    let ctx = Arc::new(context());

    let logins = (0..20).map(|_| {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move { ctx.login_with_token("reader-token", None).await })
    });
    let mut ids: Vec<_> = join_all(logins)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().session.id)
        .collect();
    ids.sort();
    ids.dedup();

    assert_eq!(ids.len(), 20);
    assert_eq!(ctx.store().sessions_for_subject("rita").len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auto_associate_never_double_books_a_channel() {
    let ctx = Arc::new(context());
    let channels: Vec<_> = (0..4).map(|_| ctx.open_channel(None)).collect();

    let mut sessions = Vec::new();
    for i in 0..6 {
        sessions.push(direct_session(&ctx, &format!("auto-{}", i), &["read"], None).await);
    }

    let attempts = sessions.iter().map(|session| {
        let ctx = Arc::clone(&ctx);
        let id = session.id.clone();
        tokio::spawn(async move { ctx.auto_associate(&id).await })
    });
    let associated = join_all(attempts)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(true)))
        .count();

    assert_eq!(associated, channels.len());
    for session in &sessions {
        assert!(ctx.bridge().channels_for_identity(&session.id).len() <= 1);
    }
}

//! The change feed returns entries in commit order, supports a `last`-only
//! query, and can be cleared.

mod common;

use common::{fresh_context, sample_object};
use orthanc_core::config::Config;

#[tokio::test]
async fn change_feed_orders_paginates_and_clears() {
    let (_dir, ctx) = fresh_context(Config::default()).await;

    assert!(ctx.get_changes(0, None).await.unwrap().is_empty());

    let mut instance_ids = Vec::new();
    for i in 0..3 {
        let sop = format!("1.2.3.4.{i}");
        let receipt = ctx
            .store_instance(sample_object("P1", "1.2.3", "1.2.3.4", &sop), "MODA")
            .await
            .unwrap()
            .receipt()
            .clone();
        instance_ids.push(receipt.instance_id);
    }

    // New patient, new study, new series and three new-instance entries.
    let changes = ctx.get_changes(0, Some(10)).await.unwrap();
    assert_eq!(changes.len(), 6);
    let seqs: Vec<u64> = changes.iter().map(|c| c.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "change feed must return entries in commit order");

    let last_instance_event = changes
        .iter()
        .rev()
        .find(|c| c.public_id == instance_ids[2])
        .expect("last stored instance should appear in the feed");
    let only_last = ctx.get_last_change().await.unwrap().unwrap();
    assert_eq!(only_last.seq, last_instance_event.seq);

    let since_first = ctx.get_changes(changes[0].seq, Some(10)).await.unwrap();
    assert_eq!(since_first.len(), changes.len() - 1);

    ctx.clear_changes().await.unwrap();
    assert!(ctx.get_changes(0, None).await.unwrap().is_empty());
    assert!(ctx.get_last_change().await.unwrap().is_none());
}

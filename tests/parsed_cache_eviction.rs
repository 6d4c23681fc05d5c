//! Churning more instances through the parsed-instance cache than its
//! capacity holds must never corrupt or lose data: evicted entries are
//! simply re-parsed from their attachment on the next access. The exact
//! LRU eviction order is covered at the unit level inside the cache
//! itself; this exercises the same behavior end to end, through the
//! context's own parse-and-cache path.

mod common;

use common::{fresh_context, sample_object};
use dicom_core::header::Header;
use dicom_dictionary_std::tags;
use orthanc_core::config::Config;

#[tokio::test]
async fn instances_remain_readable_after_churning_past_cache_capacity() {
    let (_dir, ctx) = fresh_context(Config::default()).await;

    // The cache holds 64 entries; store and then re-access more than that
    // many distinct instances so earlier ones are necessarily evicted.
    let mut instance_ids = Vec::new();
    for i in 0..80 {
        let study = format!("1.2.{i}");
        let series = format!("1.2.{i}.1");
        let sop = format!("1.2.{i}.1.1");
        let receipt = ctx
            .store_instance(sample_object("P1", &study, &series, &sop), "MODA")
            .await
            .unwrap()
            .receipt()
            .clone();
        instance_ids.push((receipt.instance_id, study));
    }

    for (instance_id, study) in &instance_ids {
        let guard = ctx.get_parsed_instance(instance_id).await.unwrap();
        let object = guard.as_ref().expect("instance should still parse after eviction");
        assert_eq!(
            object.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap(),
            study.as_str()
        );
    }

    // Re-accessing the very first instance again forces a re-parse; it
    // must still succeed and return the same data.
    let (first_id, first_study) = &instance_ids[0];
    let guard = ctx.get_parsed_instance(first_id).await.unwrap();
    let object = guard.as_ref().unwrap();
    assert_eq!(
        object.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap(),
        first_study.as_str()
    );
}

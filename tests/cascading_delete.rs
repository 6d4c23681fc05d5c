//! Deleting the last instance in a series removes the series; deleting the
//! last series in a study removes the study; and so on up the chain. Each
//! delete reports the nearest surviving ancestor, or none once the whole
//! chain is gone.

mod common;

use common::{fresh_context, sample_object};
use orthanc_core::config::Config;
use orthanc_core::index::ResourceType;

#[tokio::test]
async fn cascading_delete_unwinds_one_level_at_a_time() {
    let (_dir, ctx) = fresh_context(Config::default()).await;

    let i1 = ctx
        .store_instance(sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.1"), "MODA")
        .await
        .unwrap()
        .receipt()
        .clone();
    let i2 = ctx
        .store_instance(sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.2"), "MODA")
        .await
        .unwrap()
        .receipt()
        .clone();
    let i3 = ctx
        .store_instance(sample_object("P1", "1.2.3", "1.2.3.9", "1.2.3.9.1"), "MODA")
        .await
        .unwrap()
        .receipt()
        .clone();

    // I1 and I2 share a series; I3 sits in a sibling series of the same study.
    let remaining = ctx.delete_resource(&i1.instance_id).await.unwrap().unwrap();
    assert_eq!(remaining.resource_type, ResourceType::Series);
    assert_eq!(remaining.public_id, i1.series_id);

    let remaining = ctx.delete_resource(&i2.instance_id).await.unwrap().unwrap();
    assert_eq!(remaining.resource_type, ResourceType::Study);
    assert_eq!(remaining.public_id, i1.study_id);

    let remaining = ctx.delete_resource(&i3.instance_id).await.unwrap();
    assert!(remaining.is_none());

    let stats = ctx.statistics().await.unwrap();
    assert_eq!(stats.patient_count, 0);
    assert_eq!(stats.study_count, 0);
    assert_eq!(stats.series_count, 0);
    assert_eq!(stats.instance_count, 0);
}

//! Round-trip store/read, the baseline sanity scenario: ingest a dataset,
//! re-ingest the identical bytes, and check the hierarchy counts land
//! where the hash scheme says they should.

mod common;

use common::{fresh_context, sample_object};
use orthanc_core::config::Config;
use orthanc_core::context::StoreOutcome;

#[tokio::test]
async fn storing_the_same_instance_twice_is_idempotent() {
    let (_dir, ctx) = fresh_context(Config::default()).await;

    let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
    let first = ctx.store_instance(object, "MODA").await.unwrap();
    assert!(matches!(first, StoreOutcome::Stored(_)));

    let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
    let second = ctx.store_instance(object, "MODA").await.unwrap();
    assert!(matches!(second, StoreOutcome::AlreadyStored(_)));
    assert_eq!(first.receipt(), second.receipt());

    let stats = ctx.statistics().await.unwrap();
    assert_eq!(stats.patient_count, 1);
    assert_eq!(stats.study_count, 1);
    assert_eq!(stats.series_count, 1);
    assert_eq!(stats.instance_count, 1);
}

#[tokio::test]
async fn stored_bytes_are_readable_back() {
    let (_dir, ctx) = fresh_context(Config::default()).await;

    let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
    let outcome = ctx.store_instance(object, "MODA").await.unwrap();
    let receipt = outcome.receipt().clone();

    let bytes = ctx
        .read_attachment(&receipt.instance_id, orthanc_core::index::ContentType::Dicom)
        .await
        .unwrap();
    assert!(!bytes.is_empty());

    let json = ctx
        .read_attachment(&receipt.instance_id, orthanc_core::index::ContentType::DicomAsJson)
        .await
        .unwrap();
    assert!(!json.is_empty());
}

#[tokio::test]
async fn different_series_produce_distinct_hierarchies() {
    let (_dir, ctx) = fresh_context(Config::default()).await;

    let a = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
    let b = sample_object("P1", "1.2.3", "1.2.3.9", "1.2.3.9.1");
    ctx.store_instance(a, "MODA").await.unwrap();
    ctx.store_instance(b, "MODA").await.unwrap();

    let stats = ctx.statistics().await.unwrap();
    assert_eq!(stats.patient_count, 1);
    assert_eq!(stats.study_count, 1);
    assert_eq!(stats.series_count, 2);
    assert_eq!(stats.instance_count, 2);
}

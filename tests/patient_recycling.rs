//! Recycling under pressure: once the patient count exceeds the configured
//! ceiling, the oldest unprotected patient is evicted on the next store.
//! Protecting a patient excludes it from consideration even when it is the
//! oldest. Test objects are a handful of bytes each, so the patient-count
//! ceiling stands in for the storage-size ceiling the same selection logic
//! also serves — `select_patient_to_recycle` does not care which limit
//! asked for a candidate.

mod common;

use common::{fresh_context, sample_object};
use orthanc_core::config::Config;

fn patient(id: &str) -> dicom_object::DefaultDicomObject {
    sample_object(id, &format!("{id}.study"), &format!("{id}.series"), &format!("{id}.instance"))
}

fn patient_public_id(id: &str) -> String {
    orthanc_core::hash::hash_instance(id, &format!("{id}.study"), &format!("{id}.series"), &format!("{id}.instance"))
        .patient
}

#[tokio::test]
async fn oldest_unprotected_patient_is_recycled_first() {
    let config = Config {
        maximum_patient_count: 3,
        ..Config::default()
    };
    let (_dir, ctx) = fresh_context(config).await;

    for name in ["P0", "P1", "P2"] {
        ctx.store_instance(patient(name), "MODA").await.unwrap();
    }
    assert_eq!(ctx.statistics().await.unwrap().patient_count, 3);

    // Storing a fourth patient pushes the count over the ceiling; P0 is the
    // oldest unprotected patient and gets recycled.
    ctx.store_instance(patient("P3"), "MODA").await.unwrap();
    let stats = ctx.statistics().await.unwrap();
    assert_eq!(stats.patient_count, 3);

    assert!(ctx
        .index
        .get_resource_by_public_id(&patient_public_id("P0"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn protecting_a_patient_spares_it_from_recycling() {
    let config = Config {
        maximum_patient_count: 3,
        ..Config::default()
    };
    let (_dir, ctx) = fresh_context(config).await;

    for name in ["P0", "P1", "P2"] {
        ctx.store_instance(patient(name), "MODA").await.unwrap();
    }

    let p0_public_id = patient_public_id("P0");
    let p0 = ctx.index.get_resource_by_public_id(&p0_public_id).await.unwrap().unwrap();
    ctx.index.set_protected_patient(p0.id, true).await.unwrap();

    // P0 is the oldest but protected; P1 is evicted instead.
    ctx.store_instance(patient("P3"), "MODA").await.unwrap();

    assert!(ctx
        .index
        .get_resource_by_public_id(&p0_public_id)
        .await
        .unwrap()
        .is_some());
    assert!(ctx
        .index
        .get_resource_by_public_id(&patient_public_id("P1"))
        .await
        .unwrap()
        .is_none());
}

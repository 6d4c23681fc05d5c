//! Anonymizing a series produces a new series id, cascades fresh Study and
//! Series UIDs to both of its instances identically, scrubs identifying
//! tags, and records where the new series came from.

mod common;

use common::{fresh_context, sample_object};
use dicom_core::header::Header;
use dicom_dictionary_std::tags;
use orthanc_core::config::Config;
use orthanc_core::index::ResourceType;
use orthanc_core::modify::ModificationPlan;

#[tokio::test]
async fn anonymizing_a_series_yields_a_fresh_series_with_matching_instances() {
    let (_dir, ctx) = fresh_context(Config::default()).await;

    let r1 = ctx
        .store_instance(sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.1"), "MODA")
        .await
        .unwrap()
        .receipt()
        .clone();
    let r2 = ctx
        .store_instance(sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.2"), "MODA")
        .await
        .unwrap()
        .receipt()
        .clone();
    assert_eq!(r1.series_id, r2.series_id);
    let old_series_id = r1.series_id.clone();

    let plan = ModificationPlan::anonymization_preset();
    let outcome = ctx
        .apply_modification(&old_series_id, plan, true, "MODA")
        .await
        .unwrap();

    assert_eq!(outcome.resource_type, ResourceType::Series);
    assert_ne!(outcome.public_id, old_series_id);

    let children = ctx.index.get_children(
        ctx.index
            .get_resource_by_public_id(&outcome.public_id)
            .await
            .unwrap()
            .unwrap()
            .id,
    )
    .await
    .unwrap();
    assert_eq!(children.len(), 2);

    let mut series_uids = Vec::new();
    let mut study_uids = Vec::new();
    for child_id in children {
        let record = ctx.index.get_resource(child_id).await.unwrap().unwrap();
        let guard = ctx.get_parsed_instance(&record.public_id).await.unwrap();
        let object = guard.as_ref().expect("anonymized instance should parse");

        series_uids.push(object.element(tags::SERIES_INSTANCE_UID).unwrap().to_str().unwrap().to_string());
        study_uids.push(object.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap().to_string());

        assert_eq!(
            object
                .element(tags::PATIENT_IDENTITY_REMOVED)
                .unwrap()
                .to_str()
                .unwrap(),
            "YES"
        );
        assert!(object.element(tags::ACCESSION_NUMBER).is_err());

        let patient_id = object.element(tags::PATIENT_ID).unwrap().to_str().unwrap().to_string();
        let patient_name = object.element(tags::PATIENT_NAME).unwrap().to_str().unwrap().to_string();
        assert_eq!(patient_id, patient_name);
        assert_ne!(patient_id, "P1");
    }
    assert_eq!(series_uids[0], series_uids[1]);
    assert_eq!(study_uids[0], study_uids[1]);

    let new_series = ctx
        .index
        .get_resource_by_public_id(&outcome.public_id)
        .await
        .unwrap()
        .unwrap();
    let metadata = ctx.index.get_metadata(new_series.id, "AnonymizedFrom").await.unwrap();
    assert_eq!(metadata.as_deref(), Some(old_series_id.as_str()));
}

//! Modifying or anonymizing a single instance never stores a new instance:
//! it hands the transformed bytes straight back and leaves the resource
//! tree untouched.

mod common;

use common::{fresh_context, sample_object};
use orthanc_core::config::Config;
use orthanc_core::index::ResourceType;
use orthanc_core::modify::ModificationPlan;

#[tokio::test]
async fn modifying_an_instance_returns_bytes_without_storing() {
    let (_dir, ctx) = fresh_context(Config::default()).await;

    let receipt = ctx
        .store_instance(sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.1"), "MODA")
        .await
        .unwrap()
        .receipt()
        .clone();

    let before = ctx.index.list_by_type(ResourceType::Instance).await.unwrap().len();

    let plan = ModificationPlan::anonymization_preset();
    let outcome = ctx
        .apply_modification(&receipt.instance_id, plan, true, "MODA")
        .await
        .unwrap();

    assert_eq!(outcome.resource_type, ResourceType::Instance);
    assert!(outcome.instance_bytes.is_some());
    assert_eq!(outcome.path, format!("/instances/{}", outcome.public_id));

    let after = ctx.index.list_by_type(ResourceType::Instance).await.unwrap().len();
    assert_eq!(before, after, "instance-level modification must not store a new instance");
}

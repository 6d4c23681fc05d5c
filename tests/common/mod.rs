use std::sync::Arc;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use orthanc_core::config::Config;
use orthanc_core::context::ServerContext;
use orthanc_core::index::MetadataIndex;
use orthanc_core::storage::{CompressionKind, FilesystemContentStore};
use tempfile::TempDir;

#[allow(dead_code)]
pub async fn fresh_context(config: Config) -> (TempDir, ServerContext) {
    let dir = TempDir::new().unwrap();
    let index = MetadataIndex::open(&dir.path().join("index.redb")).unwrap();
    let store = FilesystemContentStore::new(dir.path().join("storage"), CompressionKind::None).unwrap();
    let context = ServerContext::new(Arc::new(config), index, Arc::new(store));
    (dir, context)
}

#[allow(dead_code)]
pub fn sample_object(patient: &str, study: &str, series: &str, instance: &str) -> DefaultDicomObject {
    let bare = InMemDicomObject::from_element_iter([
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient.to_string())),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^Jane".to_string())),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study.to_string())),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series.to_string())),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, instance.to_string())),
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.7".to_string()),
        ),
        DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "OT".to_string())),
    ]);
    let meta = dicom_object::FileMetaTableBuilder::new()
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
        .media_storage_sop_instance_uid(instance)
        .transfer_syntax("1.2.840.10008.1.2.1")
        .build()
        .unwrap();
    bare.with_exact_meta(meta)
}

//! Reverse direction of the bridge: writing values back onto a parsed
//! DICOM object, honouring each tag's value representation.

use dicom_core::header::Header;
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, DataDictionary, StandardDataDictionary};
use dicom_object::{DefaultDicomObject, InMemDicomObject};

use crate::error::{BridgeError, Result};

/// A single edit to apply to a dataset.
#[derive(Debug, Clone)]
pub enum MapOp {
    /// Insert the tag if absent, or overwrite it if present.
    Replace(Tag, String),
    /// Remove the tag if present; a no-op otherwise.
    Remove(Tag),
}

/// Apply a batch of edits to `object` in place.
///
/// When a `Replace` targets `SOPClassUID` or `SOPInstanceUID`, the
/// corresponding `MediaStorage…` file-meta field is kept in sync, per the
/// bridge's contract that identity fields never drift between the dataset
/// and its file-meta header.
pub fn apply(object: &mut InMemDicomObject, ops: &[MapOp]) -> Result<()> {
    for op in ops {
        match op {
            MapOp::Remove(tag) => {
                object.remove_element(*tag);
            }
            MapOp::Replace(tag, value) => {
                let vr = vr_for_tag(*tag);
                let element = DataElement::new(*tag, vr, primitive_for(vr, value));
                object.put(element);
            }
        }
    }
    Ok(())
}

/// Update `MediaStorageSOPClassUID`/`MediaStorageSOPInstanceUID` in the
/// object's file meta to track the dataset's own SOP Class/Instance UID.
///
/// Only a file-wrapped object carries a meta table to update; bare datasets
/// have nothing for this to do.
pub fn sync_media_storage_headers(object: &mut DefaultDicomObject) -> Result<()> {
    if let Ok(sop_class) = object.element(tags::SOP_CLASS_UID) {
        let value = sop_class
            .to_str()
            .map_err(|e| BridgeError::Object(e.to_string()))?
            .trim_end_matches('\0')
            .to_string();
        object.meta_mut().media_storage_sop_class_uid = value;
    }
    if let Ok(sop_instance) = object.element(tags::SOP_INSTANCE_UID) {
        let value = sop_instance
            .to_str()
            .map_err(|e| BridgeError::Object(e.to_string()))?
            .trim_end_matches('\0')
            .to_string();
        object.meta_mut().media_storage_sop_instance_uid = value;
    }
    Ok(())
}

fn vr_for_tag(tag: Tag) -> VR {
    StandardDataDictionary
        .by_tag(tag)
        .map(|e| e.vr.relaxed())
        .unwrap_or(VR::LO)
}

fn primitive_for(vr: VR, value: &str) -> PrimitiveValue {
    match vr {
        VR::IS | VR::SL | VR::SS | VR::UL | VR::US => {
            if let Ok(i) = value.parse::<i32>() {
                dicom_value!(I32, [i])
            } else {
                dicom_value!(Str, value.to_string())
            }
        }
        VR::DS | VR::FL | VR::FD => {
            if let Ok(f) = value.parse::<f64>() {
                dicom_value!(F64, [f])
            } else {
                dicom_value!(Str, value.to_string())
            }
        }
        _ => dicom_value!(Str, value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    #[test]
    fn replace_inserts_if_absent() {
        let mut obj = InMemDicomObject::new_empty();
        apply(&mut obj, &[MapOp::Replace(tags::PATIENT_ID, "P2".into())]).unwrap();
        assert_eq!(
            obj.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "P2"
        );
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let mut obj = InMemDicomObject::new_empty();
        apply(&mut obj, &[MapOp::Remove(tags::ACCESSION_NUMBER)]).unwrap();
        assert!(obj.element(tags::ACCESSION_NUMBER).is_err());
    }
}

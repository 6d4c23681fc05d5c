//! JSON projection of a parsed DICOM object.
//!
//! Each element becomes a `"gggg,eeee"` key whose leaf carries
//! `{Name, Type, Value, PrivateCreator?}`, matching the shape Orthanc's own
//! `DicomAsJson` attachments use. Strings longer than the configured
//! threshold are replaced with `Type: "TooLong"` so the tag's existence is
//! preserved without storing the oversized value.

use dicom_core::header::Header;
use dicom_core::{DataDictionary, Tag, VR};
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::InMemDicomObject;
use serde_json::{json, Map, Value};

/// Default threshold (bytes) above which a string value is reported as
/// `TooLong` rather than embedded in the JSON document.
pub const DEFAULT_TOO_LONG_THRESHOLD: usize = 256;

fn tag_key(tag: Tag) -> String {
    format!("{:04X}{:04X}", tag.group(), tag.element())
}

fn tag_name(tag: Tag) -> String {
    StandardDataDictionary
        .by_tag(tag)
        .map(|e| e.alias.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Project a dataset into its DICOM-JSON representation.
pub fn to_json(object: &InMemDicomObject, too_long_threshold: usize) -> Value {
    let mut out = Map::new();
    for element in object.iter() {
        let tag = element.header().tag;
        let vr = element.header().vr();
        let leaf = if vr == VR::SQ {
            sequence_leaf(object, tag, too_long_threshold)
        } else {
            scalar_leaf(element, tag, vr, too_long_threshold)
        };
        out.insert(tag_key(tag), leaf);
    }
    Value::Object(out)
}

fn scalar_leaf(
    element: &dicom_object::mem::InMemElement,
    tag: Tag,
    vr: VR,
    too_long_threshold: usize,
) -> Value {
    let name = tag_name(tag);
    match element.to_str() {
        Ok(raw) => {
            let s = raw.trim_end_matches('\0').to_string();
            if s.is_empty() {
                json!({ "Name": name, "Type": "Null" })
            } else if s.len() > too_long_threshold {
                json!({ "Name": name, "Type": "TooLong" })
            } else {
                json!({ "Name": name, "Type": "String", "Value": s })
            }
        }
        Err(_) => {
            let _ = vr;
            json!({ "Name": name, "Type": "Null" })
        }
    }
}

fn sequence_leaf(object: &InMemDicomObject, tag: Tag, too_long_threshold: usize) -> Value {
    let name = tag_name(tag);
    let items: Vec<Value> = object
        .element(tag)
        .ok()
        .and_then(|e| e.items())
        .map(|items| {
            items
                .iter()
                .map(|item| to_json(item, too_long_threshold))
                .collect()
        })
        .unwrap_or_default();
    json!({ "Name": name, "Type": "Sequence", "Value": items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement};
    use dicom_dictionary_std::tags;

    #[test]
    fn projects_string_element() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "P1"),
        )]);
        let v = to_json(&obj, DEFAULT_TOO_LONG_THRESHOLD);
        let leaf = &v["00100020"];
        assert_eq!(leaf["Type"], "String");
        assert_eq!(leaf["Value"], "P1");
    }

    #[test]
    fn marks_oversized_string_as_too_long() {
        let huge = "x".repeat(300);
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_COMMENTS,
            VR::LT,
            dicom_value!(Str, huge),
        )]);
        let v = to_json(&obj, DEFAULT_TOO_LONG_THRESHOLD);
        let leaf = &v["00104000"];
        assert_eq!(leaf["Type"], "TooLong");
        assert!(leaf.get("Value").is_none());
    }

    #[test]
    fn empty_string_is_null() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, ""),
        )]);
        let v = to_json(&obj, DEFAULT_TOO_LONG_THRESHOLD);
        assert_eq!(v["00100020"]["Type"], "Null");
    }
}

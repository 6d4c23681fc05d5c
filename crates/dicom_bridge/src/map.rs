//! `DicomMap`: a neutral tag -> value view of a parsed DICOM object, used
//! wherever a component needs to reason about a dataset without depending
//! on `dicom-object`'s richer (and VR-aware) element representation.

use std::collections::HashMap;

use dicom_core::{Tag, VR};
use dicom_object::InMemDicomObject;

fn is_numeric_vr(vr: VR) -> bool {
    matches!(
        vr,
        VR::IS | VR::DS | VR::UL | VR::US | VR::SL | VR::SS | VR::FL | VR::FD
    )
}

/// A single DICOM value, collapsed to one of four neutral shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum DicomValue {
    String(String),
    Integer(i64),
    Float(f64),
    Null,
}

impl DicomValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DicomValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A flat tag -> value projection of a dataset's elements.
#[derive(Debug, Clone, Default)]
pub struct DicomMap {
    values: HashMap<Tag, DicomValue>,
}

impl DicomMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: Tag) -> Option<&DicomValue> {
        self.values.get(&tag)
    }

    pub fn get_str(&self, tag: Tag) -> Option<&str> {
        self.get(tag).and_then(DicomValue::as_str)
    }

    pub fn insert(&mut self, tag: Tag, value: DicomValue) {
        self.values.insert(tag, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &DicomValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build a `DicomMap` from a parsed object's top-level elements.
    ///
    /// Sequences are not unpacked into the flat map (they carry no single
    /// scalar value); callers that need sequence contents use the JSON
    /// projection instead.
    pub fn from_object(object: &InMemDicomObject) -> Self {
        let mut map = Self::new();
        for element in object.iter() {
            let tag = element.header().tag;
            let vr = element.header().vr();
            if vr == VR::SQ {
                continue;
            }
            let value = if let Ok(s) = element.to_str() {
                let s = s.trim_end_matches('\0').to_string();
                if s.is_empty() {
                    DicomValue::Null
                } else if is_numeric_vr(vr) {
                    if let Ok(i) = s.parse::<i64>() {
                        DicomValue::Integer(i)
                    } else if let Ok(f) = s.parse::<f64>() {
                        DicomValue::Float(f)
                    } else {
                        DicomValue::String(s)
                    }
                } else {
                    DicomValue::String(s)
                }
            } else {
                DicomValue::Null
            };
            map.insert(tag, value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;

    #[test]
    fn builds_map_from_object() {
        let obj = InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "P1")),
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "DOE^JOHN")),
        ]);
        let map = DicomMap::from_object(&obj);
        assert_eq!(map.get_str(tags::PATIENT_ID), Some("P1"));
        assert_eq!(map.get_str(tags::PATIENT_NAME), Some("DOE^JOHN"));
    }

    #[test]
    fn empty_string_value_is_null() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, ""),
        )]);
        let map = DicomMap::from_object(&obj);
        assert_eq!(map.get(tags::PATIENT_ID), Some(&DicomValue::Null));
    }
}

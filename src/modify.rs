//! Modification Engine (ME): applies a declarative set of
//! {remove, replace, keep, strip-private} operations to a parsed instance,
//! rewriting Study/Series/SOP UIDs consistently across a subtree.

use std::collections::{HashMap, HashSet};

use dicom_bridge::uid::{generate_patient_id, generate_uid, ResourceLevel};
use dicom_core::header::Header;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModifyError {
    #[error("cannot remove identifying tag {0:?}")]
    CannotRemoveIdentifier(Tag),
    #[error("cannot replace {0:?}: above the declared modification level")]
    TagAboveLevel(Tag),
    #[error("bridge error: {0}")]
    Bridge(#[from] dicom_bridge::BridgeError),
}

pub type Result<T> = std::result::Result<T, ModifyError>;

fn level_rank(level: ResourceLevel) -> u8 {
    match level {
        ResourceLevel::Patient => 0,
        ResourceLevel::Study => 1,
        ResourceLevel::Series => 2,
        ResourceLevel::Instance => 3,
    }
}

/// (level, tag) pairs rewritten as the modification descends the hierarchy,
/// in parent-to-child order.
const LEVEL_UID_TAGS: &[(ResourceLevel, Tag)] = &[
    (ResourceLevel::Study, tags::STUDY_INSTANCE_UID),
    (ResourceLevel::Series, tags::SERIES_INSTANCE_UID),
    (ResourceLevel::Instance, tags::SOP_INSTANCE_UID),
];

const PROTECTED_IDENTIFIERS: &[Tag] = &[
    tags::PATIENT_ID,
    tags::STUDY_INSTANCE_UID,
    tags::SERIES_INSTANCE_UID,
    tags::SOP_INSTANCE_UID,
];

/// PS 3.15-2008 Table E.1-1 basic confidentiality profile: tags removed by
/// the anonymization preset.
const ANONYMIZATION_REMOVE_SET: &[Tag] = &[
    tags::INSTANCE_CREATOR_UID,
    tags::ACCESSION_NUMBER,
    tags::INSTITUTION_NAME,
    tags::INSTITUTION_ADDRESS,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::REFERRING_PHYSICIAN_ADDRESS,
    tags::REFERRING_PHYSICIAN_TELEPHONE_NUMBERS,
    tags::STATION_NAME,
    tags::STUDY_DESCRIPTION,
    tags::SERIES_DESCRIPTION,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_BIRTH_TIME,
    tags::PATIENT_SEX,
    tags::PATIENT_AGE,
    tags::PATIENT_SIZE,
    tags::PATIENT_WEIGHT,
    tags::MEDICAL_RECORD_LOCATOR,
    tags::ETHNIC_GROUP,
    tags::OCCUPATION,
    tags::PATIENT_COMMENTS,
    tags::DEVICE_SERIAL_NUMBER,
    tags::PROTOCOL_NAME,
    tags::STUDY_ID,
    tags::FRAME_OF_REFERENCE_UID,
    tags::IMAGE_COMMENTS,
    tags::REQUEST_ATTRIBUTES_SEQUENCE,
    tags::CONTENT_SEQUENCE,
    tags::STORAGE_MEDIA_FILE_SET_UID,
];

/// A single declarative edit driving `ModificationEngine::apply`.
#[derive(Debug, Clone)]
pub struct ModificationPlan {
    pub remove: HashSet<Tag>,
    pub replace: HashMap<Tag, String>,
    pub keep: HashSet<Tag>,
    pub strip_private: bool,
    pub level: ResourceLevel,
}

impl ModificationPlan {
    pub fn new(level: ResourceLevel) -> Self {
        Self {
            remove: HashSet::new(),
            replace: HashMap::new(),
            keep: HashSet::new(),
            strip_private: false,
            level,
        }
    }

    /// The PS 3.15-2008 basic confidentiality profile, with a fresh random
    /// PatientID assigned and copied into PatientName.
    pub fn anonymization_preset() -> Self {
        let mut plan = Self::new(ResourceLevel::Patient);
        plan.remove.extend(ANONYMIZATION_REMOVE_SET.iter().copied());
        plan.strip_private = true;
        let patient_id = generate_patient_id();
        plan.replace.insert(tags::PATIENT_ID, patient_id.clone());
        plan.replace.insert(tags::PATIENT_NAME, patient_id);
        plan.replace.insert(
            tags::DEIDENTIFICATION_METHOD,
            "basic confidentiality profile".to_string(),
        );
        plan.replace
            .insert(tags::PATIENT_IDENTITY_REMOVED, "YES".to_string());
        plan
    }
}

/// Applies modification plans to parsed instances, keeping UID rewrites
/// for a subtree consistent via a memoization map.
#[derive(Debug, Default)]
pub struct ModificationEngine {
    memo: HashMap<(ResourceLevel, String), String>,
}

impl ModificationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `plan` to `instance` in place.
    pub fn apply(&mut self, plan: &ModificationPlan, instance: &mut InMemDicomObject) -> Result<()> {
        for tag in &plan.remove {
            if PROTECTED_IDENTIFIERS.contains(tag) && !plan.keep.contains(tag) {
                return Err(ModifyError::CannotRemoveIdentifier(*tag));
            }
        }
        for tag in plan.replace.keys() {
            if let Some((tag_level, _)) = LEVEL_UID_TAGS.iter().find(|(_, t)| t == tag) {
                if level_rank(*tag_level) < level_rank(plan.level) {
                    return Err(ModifyError::TagAboveLevel(*tag));
                }
            }
        }

        if plan.strip_private {
            let private_tags: Vec<Tag> = instance
                .iter()
                .map(|e| e.header().tag)
                .filter(|t| t.group() % 2 == 1 && !plan.keep.contains(t))
                .collect();
            for tag in private_tags {
                instance.remove_element(tag);
            }
        }

        let mut ops = Vec::new();
        for tag in &plan.remove {
            if !plan.keep.contains(tag) {
                ops.push(dicom_bridge::apply::MapOp::Remove(*tag));
            }
        }
        for (tag, value) in &plan.replace {
            if plan.keep.contains(tag) {
                continue;
            }
            if instance.element(*tag).is_err() {
                ops.push(dicom_bridge::apply::MapOp::Replace(*tag, value.clone()));
            }
        }
        dicom_bridge::apply::apply(instance, &ops)?;
        // Explicit replace (non insert-if-absent for already-present tags
        // not covered above) and removes precede the UID rewrite pass.
        let mut overwrite_ops = Vec::new();
        for (tag, value) in &plan.replace {
            if !plan.keep.contains(tag) && instance.element(*tag).is_ok() {
                overwrite_ops.push(dicom_bridge::apply::MapOp::Replace(*tag, value.clone()));
            }
        }
        dicom_bridge::apply::apply(instance, &overwrite_ops)?;

        for (level, tag) in LEVEL_UID_TAGS {
            if level_rank(*level) < level_rank(plan.level) {
                continue;
            }
            let original = instance
                .element(*tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_end_matches('\0').to_string());
            let Some(original) = original else { continue };
            if original.is_empty() {
                continue;
            }
            let new_uid = match self.memo.get(&(*level, original.clone())) {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = generate_uid(*level);
                    self.memo.insert((*level, original.clone()), fresh.clone());
                    fresh
                }
            };
            dicom_bridge::apply::apply(
                instance,
                &[dicom_bridge::apply::MapOp::Replace(*tag, new_uid)],
            )?;
        }

        Ok(())
    }

    /// The new UID recorded for `original` at `level`, if this engine's
    /// instance has already rewritten it.
    pub fn mapped_uid(&self, level: ResourceLevel, original: &str) -> Option<&str> {
        self.memo
            .get(&(level, original.to_string()))
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn sample_instance() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "P1")),
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^John")),
            DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3"),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4"),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4.5"),
            ),
            DataElement::new(
                tags::ACCESSION_NUMBER,
                VR::SH,
                dicom_value!(Str, "ACC1"),
            ),
        ])
    }

    #[test]
    fn series_level_modification_rewrites_series_and_instance_only() {
        let mut engine = ModificationEngine::new();
        let plan = ModificationPlan::new(ResourceLevel::Series);
        let mut obj = sample_instance();

        engine.apply(&plan, &mut obj).unwrap();

        assert_eq!(
            obj.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap(),
            "1.2.3"
        );
        assert_ne!(
            obj.element(tags::SERIES_INSTANCE_UID).unwrap().to_str().unwrap(),
            "1.2.3.4"
        );
        assert_ne!(
            obj.element(tags::SOP_INSTANCE_UID).unwrap().to_str().unwrap(),
            "1.2.3.4.5"
        );
    }

    #[test]
    fn replacing_a_uid_above_declared_level_is_rejected() {
        let mut engine = ModificationEngine::new();
        let mut plan = ModificationPlan::new(ResourceLevel::Series);
        plan.replace
            .insert(tags::STUDY_INSTANCE_UID, "9.9.9".to_string());
        let mut obj = sample_instance();
        let err = engine.apply(&plan, &mut obj).unwrap_err();
        assert!(matches!(err, ModifyError::TagAboveLevel(_)));
    }

    #[test]
    fn anonymization_preset_strips_private_and_removes_accession_number() {
        let mut engine = ModificationEngine::new();
        let plan = ModificationPlan::anonymization_preset();
        let mut obj = sample_instance();
        obj.put(DataElement::new(
            Tag(0x0009, 0x0010),
            VR::LO,
            dicom_value!(Str, "vendor secret"),
        ));

        engine.apply(&plan, &mut obj).unwrap();

        assert!(obj.element(tags::ACCESSION_NUMBER).is_err());
        assert!(obj.element(Tag(0x0009, 0x0010)).is_err());
        assert_eq!(
            obj.element(tags::PATIENT_IDENTITY_REMOVED)
                .unwrap()
                .to_str()
                .unwrap(),
            "YES"
        );
        let patient_id = obj.element(tags::PATIENT_ID).unwrap().to_str().unwrap().to_string();
        let patient_name = obj.element(tags::PATIENT_NAME).unwrap().to_str().unwrap().to_string();
        assert_eq!(patient_id, patient_name);
    }

    #[test]
    fn memoization_keeps_a_subtree_consistent() {
        let mut engine = ModificationEngine::new();
        let plan = ModificationPlan::new(ResourceLevel::Series);

        let mut first = sample_instance();
        engine.apply(&plan, &mut first).unwrap();
        let new_series = first
            .element(tags::SERIES_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let mut second = sample_instance();
        second.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4.6"),
        ));
        engine.apply(&plan, &mut second).unwrap();

        assert_eq!(
            second
                .element(tags::SERIES_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            new_series
        );
    }
}

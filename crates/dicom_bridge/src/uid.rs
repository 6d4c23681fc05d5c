//! Fresh DICOM UID generation.

use rand::Rng;

/// The level a freshly generated UID is intended for. Purely documentary —
/// DICOM UIDs carry no level marker — but callers (the Modification Engine)
/// use it to decide which tag the UID ends up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLevel {
    Patient,
    Study,
    Series,
    Instance,
}

/// Root OID prefix used for all identifiers minted by this server.
const UID_ROOT: &str = "1.2.826.0.1.3680043.8.498";

/// Generate a fresh, syntactically valid DICOM UID (max 64 characters,
/// numeric components only, no leading zero in any component).
///
/// `level` does not influence the generated value; it exists so callers
/// document intent at the call site.
pub fn generate_uid(_level: ResourceLevel) -> String {
    let mut rng = rand::thread_rng();
    // Two numeric groups give ample collision resistance while keeping the
    // UID well under the 64-character limit.
    let a: u64 = rng.gen_range(100_000_000_000_000u64..999_999_999_999_999u64);
    let b: u64 = rng.gen_range(1_000_000_000u64..9_999_999_999u64);
    format!("{UID_ROOT}.{a}.{b}")
}

/// Generate a fresh pseudo-random Patient ID (not a UID, just an opaque
/// token), used by the anonymization preset.
pub fn generate_patient_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: u64 = rng.gen_range(100_000_000_000u64..999_999_999_999u64);
    format!("ANON{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uid_is_well_formed() {
        let uid = generate_uid(ResourceLevel::Study);
        assert!(uid.len() <= 64);
        assert!(uid.starts_with(UID_ROOT));
        assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
    }

    #[test]
    fn generated_uids_are_distinct() {
        let a = generate_uid(ResourceLevel::Instance);
        let b = generate_uid(ResourceLevel::Instance);
        assert_ne!(a, b);
    }
}

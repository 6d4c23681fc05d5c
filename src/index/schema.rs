//! Logical schema of the Metadata Index: table definitions and the record
//! shapes serialized into them. Table names are descriptive, not physical;
//! everything but small scalar keys is stored as a JSON blob, mirroring how
//! little structure redb itself imposes beyond key/value bytes.

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use crate::storage::CompressionKind;

/// Schema version this build expects. Bumped whenever a table's on-disk
/// shape changes; `MetadataIndex::open` refuses to operate against a
/// database stamped with a different value.
pub const SCHEMA_VERSION: u32 = 1;
pub const SCHEMA_VERSION_KEY: &str = "SchemaVersion";

pub const RESOURCES: TableDefinition<u64, &[u8]> = TableDefinition::new("resources");
pub const RESOURCES_BY_PUBLIC_ID: TableDefinition<&str, u64> =
    TableDefinition::new("resources_by_public_id");
/// Key: "{resource_id}:{tag}"
pub const MAIN_DICOM_TAGS: TableDefinition<&str, &str> = TableDefinition::new("main_dicom_tags");
/// Key: "{resource_id}:{metadata_type}"
pub const METADATA: TableDefinition<&str, &str> = TableDefinition::new("metadata");
/// Key: "{resource_id}:{content_type}"
pub const ATTACHMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attachments");
pub const CHANGES: TableDefinition<u64, &[u8]> = TableDefinition::new("changes");
pub const EXPORTED_RESOURCES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("exported_resources");
/// Key: sequence number (insertion order), value: patient resource id.
pub const PATIENT_RECYCLING_ORDER: TableDefinition<u64, u64> =
    TableDefinition::new("patient_recycling_order");
pub const PROTECTED_PATIENTS: TableDefinition<u64, ()> = TableDefinition::new("protected_patients");
pub const GLOBAL_PROPERTIES: TableDefinition<&str, &str> = TableDefinition::new("global_properties");
/// Key: "{parent_id}", value: JSON array of child resource ids.
pub const CHILDREN: TableDefinition<&str, &str> = TableDefinition::new("children");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceType {
    pub fn child_type(self) -> Option<ResourceType> {
        match self {
            ResourceType::Patient => Some(ResourceType::Study),
            ResourceType::Study => Some(ResourceType::Series),
            ResourceType::Series => Some(ResourceType::Instance),
            ResourceType::Instance => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    NewPatient,
    NewStudy,
    NewSeries,
    NewInstance,
    ModifiedPatient,
    ModifiedStudy,
    ModifiedSeries,
    AnonymizedStudy,
    AnonymizedSeries,
    DeletedPatient,
    DeletedStudy,
    DeletedSeries,
    DeletedInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Dicom,
    DicomAsJson,
    UserDefined(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: u64,
    pub public_id: String,
    pub resource_type: ResourceType,
    pub parent_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub uuid: uuid::Uuid,
    pub content_type: ContentType,
    pub uncompressed_size: u64,
    pub uncompressed_md5: String,
    pub compression: CompressionKind,
    pub compressed_size: u64,
    pub compressed_md5: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub change_type: ChangeType,
    pub resource_type: ResourceType,
    pub public_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub seq: u64,
    pub remote_aet: String,
    pub public_id: String,
    pub resource_type: ResourceType,
    pub timestamp: String,
}


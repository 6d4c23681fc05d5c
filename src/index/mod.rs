//! Metadata Index (MI): the transactional custodian of the resource
//! hierarchy, main DICOM tags, attachments, metadata, change log, export
//! log, global properties and patient-recycling order.
//!
//! Backed by `redb`, one embedded database file per server instance. Every
//! logical operation runs inside a single write transaction serialized
//! through `write_lock`; reads use their own transaction and never block
//! writers for longer than the underlying page cache requires.

pub mod error;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use tokio::sync::Mutex;

pub use error::{IndexError, IndexResult};
pub use schema::{
    AttachmentRecord, ChangeRecord, ChangeType, ContentType, ExportRecord, ResourceRecord,
    ResourceType,
};

/// What survives a cascading delete, if anything.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RemainingAncestor {
    pub resource_type: ResourceType,
    pub public_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub deleted_attachments: Vec<AttachmentRecord>,
    pub remaining_ancestor: Option<RemainingAncestor>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Statistics {
    pub patient_count: u64,
    pub study_count: u64,
    pub series_count: u64,
    pub instance_count: u64,
    pub total_uncompressed_size: u64,
    pub total_disk_size: u64,
}

const NEXT_RESOURCE_ID: &str = "NextResourceId";
const NEXT_CHANGE_SEQ: &str = "NextChangeSeq";
const NEXT_EXPORT_SEQ: &str = "NextExportSeq";
const NEXT_RECYCLING_SEQ: &str = "NextRecyclingSeq";

pub struct MetadataIndex {
    db: Arc<Database>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for MetadataIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataIndex").finish_non_exhaustive()
    }
}

impl MetadataIndex {
    /// Open (creating if absent) the index at `path`, checking the schema
    /// version stamp before returning.
    pub fn open(path: &Path) -> IndexResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IndexError::Internal(e.to_string()))?;
        }
        let db = Database::create(path).map_err(|e| IndexError::Internal(e.to_string()))?;

        {
            let txn = db.begin_write()?;
            for table in [
                schema::RESOURCES,
                schema::CHANGES,
                schema::EXPORTED_RESOURCES,
            ] {
                txn.open_table(table)?;
            }
            txn.open_table(schema::RESOURCES_BY_PUBLIC_ID)?;
            txn.open_table(schema::MAIN_DICOM_TAGS)?;
            txn.open_table(schema::METADATA)?;
            txn.open_table(schema::ATTACHMENTS)?;
            txn.open_table(schema::PATIENT_RECYCLING_ORDER)?;
            txn.open_table(schema::PROTECTED_PATIENTS)?;
            txn.open_table(schema::GLOBAL_PROPERTIES)?;
            txn.open_table(schema::CHILDREN)?;

            {
                let mut props = txn.open_table(schema::GLOBAL_PROPERTIES)?;
                match props.get(schema::SCHEMA_VERSION_KEY)? {
                    Some(existing) => {
                        let found: u32 = existing
                            .value()
                            .parse()
                            .map_err(|_| IndexError::Internal("corrupt schema version".into()))?;
                        if found != schema::SCHEMA_VERSION {
                            return Err(IndexError::IncompatibleDatabaseVersion {
                                found,
                                expected: schema::SCHEMA_VERSION,
                            });
                        }
                    }
                    None => {
                        props.insert(
                            schema::SCHEMA_VERSION_KEY,
                            schema::SCHEMA_VERSION.to_string().as_str(),
                        )?;
                    }
                }
            }
            txn.commit()?;
        }

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn write<F, R>(&self, f: F) -> IndexResult<R>
    where
        F: FnOnce(&redb::WriteTransaction) -> IndexResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write()?;
            let result = f(&txn)?;
            txn.commit()?;
            Ok(result)
        })
        .await
        .map_err(|e| IndexError::Internal(e.to_string()))?
    }

    async fn read<F, R>(&self, f: F) -> IndexResult<R>
    where
        F: FnOnce(&redb::ReadTransaction) -> IndexResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read()?;
            f(&txn)
        })
        .await
        .map_err(|e| IndexError::Internal(e.to_string()))?
    }

    fn next_sequence(txn: &redb::WriteTransaction, name: &str) -> IndexResult<u64> {
        let mut props = txn.open_table(schema::GLOBAL_PROPERTIES)?;
        let current: u64 = props
            .get(name)?
            .map(|v| v.value().parse().unwrap_or(0))
            .unwrap_or(0);
        let next = current + 1;
        props.insert(name, next.to_string().as_str())?;
        Ok(current)
    }

    fn children_key(parent_id: u64) -> String {
        parent_id.to_string()
    }

    fn tag_key(resource_id: u64, tag: &str) -> String {
        format!("{resource_id}:{tag}")
    }

    fn meta_key(resource_id: u64, metadata_type: &str) -> String {
        format!("{resource_id}:{metadata_type}")
    }

    fn attachment_key(resource_id: u64, content_type: ContentType) -> IndexResult<String> {
        Ok(format!("{resource_id}:{}", serde_json::to_string(&content_type)?))
    }

    // --- Resources -----------------------------------------------------

    /// Create a resource, or return the id of an existing one with the
    /// same public id (instances sharing identifiers collapse to one
    /// resource, per the hierarchy's identity contract).
    pub async fn create_resource(
        &self,
        public_id: String,
        resource_type: ResourceType,
        parent_id: Option<u64>,
    ) -> IndexResult<(u64, bool)> {
        self.write(move |txn| {
            let existing = {
                let table = txn.open_table(schema::RESOURCES_BY_PUBLIC_ID)?;
                table.get(public_id.as_str())?.map(|v| v.value())
            };
            if let Some(id) = existing {
                return Ok((id, false));
            }

            let id = Self::next_sequence(txn, NEXT_RESOURCE_ID)?;
            let record = ResourceRecord {
                id,
                public_id: public_id.clone(),
                resource_type,
                parent_id,
            };
            {
                let mut resources = txn.open_table(schema::RESOURCES)?;
                resources.insert(id, serde_json::to_vec(&record)?.as_slice())?;
            }
            {
                let mut by_public = txn.open_table(schema::RESOURCES_BY_PUBLIC_ID)?;
                by_public.insert(public_id.as_str(), id)?;
            }
            if let Some(parent) = parent_id {
                Self::attach_child_txn(txn, parent, id)?;
            }
            Ok((id, true))
        })
        .await
    }

    fn attach_child_txn(txn: &redb::WriteTransaction, parent_id: u64, child_id: u64) -> IndexResult<()> {
        let key = Self::children_key(parent_id);
        let mut children: Vec<u64> = {
            let table = txn.open_table(schema::CHILDREN)?;
            match table.get(key.as_str())? {
                Some(v) => serde_json::from_str(v.value())?,
                None => Vec::new(),
            }
        };
        if !children.contains(&child_id) {
            children.push(child_id);
            let mut table = txn.open_table(schema::CHILDREN)?;
            table.insert(key.as_str(), serde_json::to_string(&children)?.as_str())?;
        }
        Ok(())
    }

    pub async fn get_resource(&self, id: u64) -> IndexResult<Option<ResourceRecord>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::RESOURCES)?;
            match table.get(id)? {
                Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn get_resource_by_public_id(
        &self,
        public_id: &str,
    ) -> IndexResult<Option<ResourceRecord>> {
        let public_id = public_id.to_string();
        self.read(move |txn| {
            let id = {
                let table = txn.open_table(schema::RESOURCES_BY_PUBLIC_ID)?;
                table.get(public_id.as_str())?.map(|v| v.value())
            };
            match id {
                Some(id) => {
                    let resources = txn.open_table(schema::RESOURCES)?;
                    match resources.get(id)? {
                        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
                        None => Ok(None),
                    }
                }
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn lookup_parent(&self, id: u64) -> IndexResult<Option<u64>> {
        Ok(self.get_resource(id).await?.and_then(|r| r.parent_id))
    }

    pub async fn get_children(&self, id: u64) -> IndexResult<Vec<u64>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::CHILDREN)?;
            match table.get(Self::children_key(id).as_str())? {
                Some(v) => Ok(serde_json::from_str(v.value())?),
                None => Ok(Vec::new()),
            }
        })
        .await
    }

    /// Every resource of `resource_type`, in no particular order.
    pub async fn list_by_type(&self, resource_type: ResourceType) -> IndexResult<Vec<u64>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::RESOURCES)?;
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let record: ResourceRecord = serde_json::from_slice(v.value())?;
                if record.resource_type == resource_type {
                    out.push(k.value());
                }
            }
            Ok(out)
        })
        .await
    }

    // --- Main DICOM tags -------------------------------------------------

    pub async fn set_main_dicom_tags(&self, id: u64, tags: Vec<(String, String)>) -> IndexResult<()> {
        self.write(move |txn| {
            let mut table = txn.open_table(schema::MAIN_DICOM_TAGS)?;
            for (tag, value) in &tags {
                table.insert(Self::tag_key(id, tag).as_str(), value.as_str())?;
            }
            Ok(())
        })
        .await
    }

    /// Every `(tag, value)` pair recorded for `id`.
    pub async fn get_main_dicom_tags(&self, id: u64) -> IndexResult<Vec<(String, String)>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::MAIN_DICOM_TAGS)?;
            let prefix = format!("{id}:");
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                if let Some(tag) = k.value().strip_prefix(&prefix) {
                    out.push((tag.to_string(), v.value().to_string()));
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn lookup_tag_value(&self, tag: &str, value: &str) -> IndexResult<Vec<u64>> {
        let tag = tag.to_string();
        let value = value.to_string();
        self.read(move |txn| {
            let table = txn.open_table(schema::MAIN_DICOM_TAGS)?;
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let key = k.value();
                if v.value() != value {
                    continue;
                }
                if let Some((id_str, tag_str)) = key.rsplit_once(':') {
                    if tag_str == tag {
                        if let Ok(id) = id_str.parse::<u64>() {
                            out.push(id);
                        }
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    // --- Attachments -----------------------------------------------------

    pub async fn add_attachment(
        &self,
        resource_id: u64,
        record: AttachmentRecord,
    ) -> IndexResult<()> {
        self.write(move |txn| {
            let key = Self::attachment_key(resource_id, record.content_type)?;
            let mut table = txn.open_table(schema::ATTACHMENTS)?;
            table.insert(key.as_str(), serde_json::to_vec(&record)?.as_slice())?;
            Ok(())
        })
        .await
    }

    pub async fn lookup_attachment(
        &self,
        resource_id: u64,
        content_type: ContentType,
    ) -> IndexResult<Option<AttachmentRecord>> {
        self.read(move |txn| {
            let key = Self::attachment_key(resource_id, content_type)?;
            let table = txn.open_table(schema::ATTACHMENTS)?;
            match table.get(key.as_str())? {
                Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// List every content type currently attached to `resource_id`,
    /// whatever its flavor (DICOM file, DICOM-as-JSON, or a user-defined
    /// attachment registered through `UserContentType`).
    pub async fn list_attachments(&self, resource_id: u64) -> IndexResult<Vec<ContentType>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::ATTACHMENTS)?;
            let prefix = format!("{resource_id}:");
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (k, _) = entry?;
                if let Some(rest) = k.value().strip_prefix(&prefix) {
                    out.push(serde_json::from_str(rest)?);
                }
            }
            Ok(out)
        })
        .await
    }

    // --- Metadata ---------------------------------------------------------

    pub async fn set_metadata(&self, id: u64, metadata_type: String, value: String) -> IndexResult<()> {
        self.write(move |txn| {
            let mut table = txn.open_table(schema::METADATA)?;
            table.insert(Self::meta_key(id, &metadata_type).as_str(), value.as_str())?;
            Ok(())
        })
        .await
    }

    pub async fn get_metadata(&self, id: u64, metadata_type: &str) -> IndexResult<Option<String>> {
        let metadata_type = metadata_type.to_string();
        self.read(move |txn| {
            let table = txn.open_table(schema::METADATA)?;
            Ok(table
                .get(Self::meta_key(id, &metadata_type).as_str())?
                .map(|v| v.value().to_string()))
        })
        .await
    }

    pub async fn list_available_metadata(&self, id: u64) -> IndexResult<Vec<String>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::METADATA)?;
            let prefix = format!("{id}:");
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (k, _) = entry?;
                if let Some(rest) = k.value().strip_prefix(&prefix) {
                    out.push(rest.to_string());
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn delete_metadata(&self, id: u64, metadata_type: &str) -> IndexResult<bool> {
        let metadata_type = metadata_type.to_string();
        self.write(move |txn| {
            let mut table = txn.open_table(schema::METADATA)?;
            let removed = table.remove(Self::meta_key(id, &metadata_type).as_str())?;
            Ok(removed.is_some())
        })
        .await
    }

    // --- Global properties -------------------------------------------------

    pub async fn get_global_property(&self, name: &str) -> IndexResult<Option<String>> {
        let name = name.to_string();
        self.read(move |txn| {
            let table = txn.open_table(schema::GLOBAL_PROPERTIES)?;
            Ok(table.get(name.as_str())?.map(|v| v.value().to_string()))
        })
        .await
    }

    pub async fn set_global_property(&self, name: String, value: String) -> IndexResult<()> {
        self.write(move |txn| {
            let mut table = txn.open_table(schema::GLOBAL_PROPERTIES)?;
            table.insert(name.as_str(), value.as_str())?;
            Ok(())
        })
        .await
    }

    pub async fn increment_global_sequence(&self, name: String) -> IndexResult<u64> {
        self.write(move |txn| {
            let next = Self::next_sequence(txn, &name)?;
            Ok(next)
        })
        .await
    }

    // --- Changes ------------------------------------------------------------

    pub async fn log_change(
        &self,
        change_type: ChangeType,
        resource_type: ResourceType,
        public_id: String,
        timestamp: String,
    ) -> IndexResult<u64> {
        self.write(move |txn| {
            let seq = Self::next_sequence(txn, NEXT_CHANGE_SEQ)?;
            let record = ChangeRecord {
                seq,
                change_type,
                resource_type,
                public_id,
                timestamp,
            };
            let mut table = txn.open_table(schema::CHANGES)?;
            table.insert(seq, serde_json::to_vec(&record)?.as_slice())?;
            Ok(seq)
        })
        .await
    }

    /// Entries with id > `since`, in ascending order, clamped to `limit`
    /// (itself clamped to 100 by the caller's default, per the REST facade).
    pub async fn get_changes(&self, since: u64, limit: usize) -> IndexResult<Vec<ChangeRecord>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::CHANGES)?;
            let mut out = Vec::new();
            for entry in table.range((since + 1)..)? {
                let (_, v) = entry?;
                out.push(serde_json::from_slice::<ChangeRecord>(v.value())?);
                if out.len() >= limit {
                    break;
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn get_last_change(&self) -> IndexResult<Option<ChangeRecord>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::CHANGES)?;
            match table.iter()?.next_back() {
                Some(entry) => {
                    let (_, v) = entry?;
                    Ok(Some(serde_json::from_slice(v.value())?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn clear_changes(&self) -> IndexResult<()> {
        self.write(move |txn| {
            let mut table = txn.open_table(schema::CHANGES)?;
            let keys: Vec<u64> = table.iter()?.map(|e| e.map(|(k, _)| k.value())).collect::<Result<_, _>>()?;
            for key in keys {
                table.remove(key)?;
            }
            Ok(())
        })
        .await
    }

    // --- Export log -----------------------------------------------------------

    /// Record that `public_id` was pushed to `remote_aet` via C-MOVE.
    pub async fn log_export(
        &self,
        remote_aet: String,
        resource_type: ResourceType,
        public_id: String,
        timestamp: String,
    ) -> IndexResult<u64> {
        self.write(move |txn| {
            let seq = Self::next_sequence(txn, NEXT_EXPORT_SEQ)?;
            let record = ExportRecord {
                seq,
                remote_aet,
                public_id,
                resource_type,
                timestamp,
            };
            let mut table = txn.open_table(schema::EXPORTED_RESOURCES)?;
            table.insert(seq, serde_json::to_vec(&record)?.as_slice())?;
            Ok(seq)
        })
        .await
    }

    /// Entries with id > `since`, in ascending order, clamped to `limit`.
    pub async fn get_exports(&self, since: u64, limit: usize) -> IndexResult<Vec<ExportRecord>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::EXPORTED_RESOURCES)?;
            let mut out = Vec::new();
            for entry in table.range((since + 1)..)? {
                let (_, v) = entry?;
                out.push(serde_json::from_slice::<ExportRecord>(v.value())?);
                if out.len() >= limit {
                    break;
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn clear_exports(&self) -> IndexResult<()> {
        self.write(move |txn| {
            let mut table = txn.open_table(schema::EXPORTED_RESOURCES)?;
            let keys: Vec<u64> = table.iter()?.map(|e| e.map(|(k, _)| k.value())).collect::<Result<_, _>>()?;
            for key in keys {
                table.remove(key)?;
            }
            Ok(())
        })
        .await
    }

    // --- Patient recycling --------------------------------------------------

    /// Move (or insert) `patient_id` to the most-recent end of the
    /// recycling order.
    pub async fn touch_patient(&self, patient_id: u64) -> IndexResult<()> {
        self.write(move |txn| {
            {
                let mut table = txn.open_table(schema::PATIENT_RECYCLING_ORDER)?;
                let stale: Vec<u64> = table
                    .iter()?
                    .filter_map(|e| e.ok())
                    .filter(|(_, v)| v.value() == patient_id)
                    .map(|(k, _)| k.value())
                    .collect();
                for seq in stale {
                    table.remove(seq)?;
                }
            }
            let seq = Self::next_sequence(txn, NEXT_RECYCLING_SEQ)?;
            let mut table = txn.open_table(schema::PATIENT_RECYCLING_ORDER)?;
            table.insert(seq, patient_id)?;
            Ok(())
        })
        .await
    }

    /// Remove `patient_id` from the recycling order entirely (used when
    /// protecting a patient, and as part of cascading delete).
    pub async fn remove_from_recycling_order(&self, patient_id: u64) -> IndexResult<()> {
        self.write(move |txn| {
            let mut table = txn.open_table(schema::PATIENT_RECYCLING_ORDER)?;
            let stale: Vec<u64> = table
                .iter()?
                .filter_map(|e| e.ok())
                .filter(|(_, v)| v.value() == patient_id)
                .map(|(k, _)| k.value())
                .collect();
            for seq in stale {
                table.remove(seq)?;
            }
            Ok(())
        })
        .await
    }

    /// Oldest patient in the recycling order whose id != `avoid`, if any.
    pub async fn select_patient_to_recycle(&self, avoid: Option<u64>) -> IndexResult<Option<u64>> {
        self.read(move |txn| {
            let table = txn.open_table(schema::PATIENT_RECYCLING_ORDER)?;
            for entry in table.iter()? {
                let (_, v) = entry?;
                let candidate = v.value();
                if Some(candidate) != avoid {
                    return Ok(Some(candidate));
                }
            }
            Ok(None)
        })
        .await
    }

    pub async fn set_protected_patient(&self, id: u64, protected: bool) -> IndexResult<()> {
        self.write(move |txn| {
            {
                let mut table = txn.open_table(schema::PROTECTED_PATIENTS)?;
                if protected {
                    table.insert(id, ())?;
                } else {
                    table.remove(id)?;
                }
            }
            Ok(())
        })
        .await?;
        if protected {
            self.remove_from_recycling_order(id).await?;
        } else {
            self.touch_patient(id).await?;
        }
        Ok(())
    }

    pub async fn is_protected_patient(&self, id: u64) -> IndexResult<bool> {
        self.read(move |txn| {
            let table = txn.open_table(schema::PROTECTED_PATIENTS)?;
            Ok(table.get(id)?.is_some())
        })
        .await
    }

    // --- Statistics -----------------------------------------------------

    pub async fn get_statistics(&self) -> IndexResult<Statistics> {
        self.read(move |txn| {
            let resources = txn.open_table(schema::RESOURCES)?;
            let mut stats = Statistics::default();
            for entry in resources.iter()? {
                let (_, v) = entry?;
                let record: ResourceRecord = serde_json::from_slice(v.value())?;
                match record.resource_type {
                    ResourceType::Patient => stats.patient_count += 1,
                    ResourceType::Study => stats.study_count += 1,
                    ResourceType::Series => stats.series_count += 1,
                    ResourceType::Instance => stats.instance_count += 1,
                }
            }
            let attachments = txn.open_table(schema::ATTACHMENTS)?;
            for entry in attachments.iter()? {
                let (_, v) = entry?;
                let record: AttachmentRecord = serde_json::from_slice(v.value())?;
                stats.total_uncompressed_size += record.uncompressed_size;
                stats.total_disk_size += record.compressed_size;
            }
            Ok(stats)
        })
        .await
    }

    // --- Cascading delete --------------------------------------------------

    /// Delete `id` and every descendant depth-first, collecting every
    /// attachment encountered so the caller can unlink the corresponding
    /// blobs from the Content Store, then walks upward deleting any
    /// now-childless ancestor. Returns the highest surviving ancestor, if
    /// any.
    pub async fn delete_resource(&self, id: u64) -> IndexResult<DeleteOutcome> {
        self.write(move |txn| Self::delete_resource_txn(txn, id)).await
    }

    fn delete_resource_txn(txn: &redb::WriteTransaction, id: u64) -> IndexResult<DeleteOutcome> {
        // Capture the ancestor chain before anything is removed: once a
        // resource is deleted its parent pointer is gone, so cascading
        // upward past more than one now-empty ancestor would otherwise
        // lose track of where to stop.
        let chain = Self::ancestor_chain(txn, id)?;

        let mut outcome = DeleteOutcome::default();
        Self::delete_subtree(txn, id, &mut outcome.deleted_attachments)?;

        for ancestor_id in chain {
            let table = txn.open_table(schema::RESOURCES)?;
            if let Some(v) = table.get(ancestor_id)? {
                let record: ResourceRecord = serde_json::from_slice(v.value())?;
                outcome.remaining_ancestor = Some(RemainingAncestor {
                    resource_type: record.resource_type,
                    public_id: record.public_id,
                });
                break;
            }
        }
        Ok(outcome)
    }

    /// Parent ids from `id` up to the root, in order, as they stood before
    /// deletion.
    fn ancestor_chain(txn: &redb::WriteTransaction, id: u64) -> IndexResult<Vec<u64>> {
        let mut chain = Vec::new();
        let mut current = id;
        loop {
            let table = txn.open_table(schema::RESOURCES)?;
            let record = match table.get(current)? {
                Some(v) => serde_json::from_slice::<ResourceRecord>(v.value())?,
                None => break,
            };
            match record.parent_id {
                Some(parent_id) => {
                    chain.push(parent_id);
                    current = parent_id;
                }
                None => break,
            }
        }
        Ok(chain)
    }

    fn delete_subtree(
        txn: &redb::WriteTransaction,
        id: u64,
        deleted: &mut Vec<AttachmentRecord>,
    ) -> IndexResult<()> {
        let children = {
            let table = txn.open_table(schema::CHILDREN)?;
            match table.get(Self::children_key(id).as_str())? {
                Some(v) => serde_json::from_str::<Vec<u64>>(v.value())?,
                None => Vec::new(),
            }
        };
        for child in children {
            Self::delete_subtree(txn, child, deleted)?;
        }

        let record = {
            let table = txn.open_table(schema::RESOURCES)?;
            match table.get(id)? {
                Some(v) => serde_json::from_slice::<ResourceRecord>(v.value())?,
                None => return Ok(()),
            }
        };

        let attached_types = {
            let table = txn.open_table(schema::ATTACHMENTS)?;
            let prefix = format!("{id}:");
            let mut types = Vec::new();
            for entry in table.iter()? {
                let (k, _) = entry?;
                if let Some(rest) = k.value().strip_prefix(&prefix) {
                    types.push(serde_json::from_str::<ContentType>(rest)?);
                }
            }
            types
        };
        for content_type in attached_types {
            let key = Self::attachment_key(id, content_type)?;
            let removed = {
                let mut table = txn.open_table(schema::ATTACHMENTS)?;
                table.remove(key.as_str())?
            };
            if let Some(v) = removed {
                deleted.push(serde_json::from_slice(v.value())?);
            }
        }

        {
            let mut table = txn.open_table(schema::RESOURCES)?;
            table.remove(id)?;
        }
        {
            let mut table = txn.open_table(schema::RESOURCES_BY_PUBLIC_ID)?;
            table.remove(record.public_id.as_str())?;
        }
        {
            let mut table = txn.open_table(schema::CHILDREN)?;
            table.remove(Self::children_key(id).as_str())?;
        }
        if record.resource_type == ResourceType::Patient {
            let mut table = txn.open_table(schema::PATIENT_RECYCLING_ORDER)?;
            let stale: Vec<u64> = table
                .iter()?
                .filter_map(|e| e.ok())
                .filter(|(_, v)| v.value() == id)
                .map(|(k, _)| k.value())
                .collect();
            for seq in stale {
                table.remove(seq)?;
            }
        }

        if let Some(parent_id) = record.parent_id {
            // Detach from parent's child list.
            {
                let key = Self::children_key(parent_id);
                let remaining: Vec<u64> = {
                    let table = txn.open_table(schema::CHILDREN)?;
                    match table.get(key.as_str())? {
                        Some(v) => serde_json::from_str::<Vec<u64>>(v.value())?
                            .into_iter()
                            .filter(|c| *c != id)
                            .collect(),
                        None => Vec::new(),
                    }
                };
                let mut table = txn.open_table(schema::CHILDREN)?;
                if remaining.is_empty() {
                    table.remove(key.as_str())?;
                } else {
                    table.insert(key.as_str(), serde_json::to_string(&remaining)?.as_str())?;
                }

                if remaining.is_empty() {
                    // Parent is now childless: recurse upward, same policy.
                    Self::delete_subtree(txn, parent_id, deleted)?;
                }
            }
        }

        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_index() -> (TempDir, MetadataIndex) {
        let dir = TempDir::new().unwrap();
        let index = MetadataIndex::open(&dir.path().join("index.redb")).unwrap();
        (dir, index)
    }

    #[tokio::test]
    async fn creating_same_public_id_twice_collapses() {
        let (_dir, index) = open_index().await;
        let (id1, created1) = index
            .create_resource("hash-p1".into(), ResourceType::Patient, None)
            .await
            .unwrap();
        let (id2, created2) = index
            .create_resource("hash-p1".into(), ResourceType::Patient, None)
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert!(created1);
        assert!(!created2);
    }

    #[tokio::test]
    async fn parent_child_chain_is_navigable() {
        let (_dir, index) = open_index().await;
        let (patient, _) = index
            .create_resource("p1".into(), ResourceType::Patient, None)
            .await
            .unwrap();
        let (study, _) = index
            .create_resource("s1".into(), ResourceType::Study, Some(patient))
            .await
            .unwrap();
        assert_eq!(index.lookup_parent(study).await.unwrap(), Some(patient));
        assert_eq!(index.get_children(patient).await.unwrap(), vec![study]);
    }

    #[tokio::test]
    async fn cascading_delete_reports_remaining_ancestor() {
        let (_dir, index) = open_index().await;
        let (patient, _) = index
            .create_resource("p1".into(), ResourceType::Patient, None)
            .await
            .unwrap();
        let (study, _) = index
            .create_resource("s1".into(), ResourceType::Study, Some(patient))
            .await
            .unwrap();
        let (series, _) = index
            .create_resource("se1".into(), ResourceType::Series, Some(study))
            .await
            .unwrap();
        let (i1, _) = index
            .create_resource("i1".into(), ResourceType::Instance, Some(series))
            .await
            .unwrap();
        let (i2, _) = index
            .create_resource("i2".into(), ResourceType::Instance, Some(series))
            .await
            .unwrap();

        index.delete_resource(i1).await.unwrap();
        assert_eq!(index.get_children(series).await.unwrap(), vec![i2]);

        index.delete_resource(i2).await.unwrap();
        assert!(index.get_resource(series).await.unwrap().is_none());
        assert!(index.get_resource(study).await.unwrap().is_none());
        assert!(index.get_resource(patient).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recycling_order_returns_oldest_unprotected() {
        let (_dir, index) = open_index().await;
        let (p0, _) = index
            .create_resource("p0".into(), ResourceType::Patient, None)
            .await
            .unwrap();
        let (p1, _) = index
            .create_resource("p1".into(), ResourceType::Patient, None)
            .await
            .unwrap();
        index.touch_patient(p0).await.unwrap();
        index.touch_patient(p1).await.unwrap();

        assert_eq!(
            index.select_patient_to_recycle(None).await.unwrap(),
            Some(p0)
        );
        index.set_protected_patient(p0, true).await.unwrap();
        assert_eq!(
            index.select_patient_to_recycle(None).await.unwrap(),
            Some(p1)
        );
    }

    #[tokio::test]
    async fn select_patient_to_recycle_avoiding_only_patient_returns_none() {
        let (_dir, index) = open_index().await;
        let (p0, _) = index
            .create_resource("only".into(), ResourceType::Patient, None)
            .await
            .unwrap();
        index.touch_patient(p0).await.unwrap();
        assert_eq!(
            index.select_patient_to_recycle(Some(p0)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn change_log_is_monotonic_and_paginates() {
        let (_dir, index) = open_index().await;
        for i in 0..3 {
            index
                .log_change(
                    ChangeType::NewInstance,
                    ResourceType::Instance,
                    format!("i{i}"),
                    "2026-01-01T00:00:00Z".into(),
                )
                .await
                .unwrap();
        }
        let changes = index.get_changes(0, 10).await.unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes.windows(2).all(|w| w[0].seq < w[1].seq));

        let last = index.get_last_change().await.unwrap().unwrap();
        assert_eq!(last.public_id, "i2");

        index.clear_changes().await.unwrap();
        assert!(index.get_changes(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopening_with_mismatched_version_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.redb");
        {
            let index = MetadataIndex::open(&path).unwrap();
            index
                .set_global_property(
                    schema::SCHEMA_VERSION_KEY.to_string(),
                    "999".to_string(),
                )
                .await
                .unwrap();
        }
        let err = MetadataIndex::open(&path).unwrap_err();
        assert!(matches!(
            err,
            IndexError::IncompatibleDatabaseVersion { .. }
        ));
    }
}

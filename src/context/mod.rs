//! Server Context (SX): the composition root. Every DICOM and REST
//! operation funnels through here, which wires the Content Store, the
//! Metadata Index, the Resource Hasher, the Modification Engine and the
//! Parsed-Instance Cache into the store/find/move/modify/delete algorithms
//! the rest of the server calls.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dicom_core::header::Header;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use dicom_bridge::uid::ResourceLevel;
use dicom_bridge::{apply::MapOp, DicomMap};
use dimse::config::{DimseConfig, RemoteNode};
use dimse::scu::DimseScu;
use dimse::types::{DatasetStream, QueryLevel};
use dimse::MoveReport;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

pub mod dicom_handler;

use crate::cache::ParsedCache;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::hash::{hash_instance, ResourceHashes};
use crate::index::{
    AttachmentRecord, ChangeRecord, ChangeType, ContentType, MetadataIndex, RemainingAncestor,
    ResourceType, Statistics,
};
use crate::modify::{ModificationEngine, ModificationPlan};
use crate::storage::{CompressionKind, ContentStore};

const PARSED_CACHE_CAPACITY: usize = 64;

const PATIENT_MAIN_TAGS: &[Tag] = &[
    tags::PATIENT_ID,
    tags::PATIENT_NAME,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
];

const STUDY_MAIN_TAGS: &[Tag] = &[
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_ID,
    tags::STUDY_DESCRIPTION,
    tags::ACCESSION_NUMBER,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_NAME,
];

const SERIES_MAIN_TAGS: &[Tag] = &[
    tags::SERIES_INSTANCE_UID,
    tags::SERIES_NUMBER,
    tags::MODALITY,
    tags::SERIES_DESCRIPTION,
    tags::SERIES_DATE,
    tags::SERIES_TIME,
    tags::BODY_PART_EXAMINED,
];

const INSTANCE_MAIN_TAGS: &[Tag] = &[
    tags::SOP_INSTANCE_UID,
    tags::SOP_CLASS_UID,
    tags::INSTANCE_NUMBER,
    tags::NUMBER_OF_FRAMES,
];

/// The four public ids a stored instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    pub patient_id: String,
    pub study_id: String,
    pub series_id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored(StoreReceipt),
    AlreadyStored(StoreReceipt),
}

impl StoreOutcome {
    pub fn receipt(&self) -> &StoreReceipt {
        match self {
            StoreOutcome::Stored(r) | StoreOutcome::AlreadyStored(r) => r,
        }
    }
}

/// The resource a modification or anonymization request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationOutcome {
    pub resource_type: ResourceType,
    pub public_id: String,
    pub patient_id: String,
    /// REST path of the produced resource, e.g. `/series/<id>`.
    pub path: String,
    /// Set only for instance-level requests: Orthanc never stores the
    /// rewritten instance in that case, it hands the transformed file
    /// straight back to the caller instead.
    pub instance_bytes: Option<Vec<u8>>,
}

fn resource_path(resource_type: ResourceType, public_id: &str) -> String {
    let segment = match resource_type {
        ResourceType::Patient => "patients",
        ResourceType::Study => "studies",
        ResourceType::Series => "series",
        ResourceType::Instance => "instances",
    };
    format!("/{segment}/{public_id}")
}

/// Composition root tying the Content Store, Metadata Index, Modification
/// Engine and Parsed-Instance Cache into the server's algorithms.
pub struct ServerContext {
    pub config: Arc<Config>,
    pub index: MetadataIndex,
    pub content_store: Arc<dyn ContentStore>,
    parsed_cache: ParsedCache<std::result::Result<DefaultDicomObject, String>>,
    engine: AsyncMutex<ModificationEngine>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext").finish_non_exhaustive()
    }
}

impl ServerContext {
    pub fn new(config: Arc<Config>, index: MetadataIndex, content_store: Arc<dyn ContentStore>) -> Self {
        Self {
            config,
            index,
            content_store,
            parsed_cache: ParsedCache::new(PARSED_CACHE_CAPACITY),
            engine: AsyncMutex::new(ModificationEngine::new()),
        }
    }

    // --- Store ------------------------------------------------------------

    /// Store a single instance, cascading creation up the Patient/Study/
    /// Series/Instance hierarchy. Idempotent: storing the same instance
    /// twice returns `AlreadyStored` rather than writing a second copy.
    pub async fn store_instance(
        &self,
        object: DefaultDicomObject,
        remote_aet: &str,
    ) -> Result<StoreOutcome> {
        let patient_id = required_str(&object, tags::PATIENT_ID)?;
        let study_uid = required_str(&object, tags::STUDY_INSTANCE_UID)?;
        let series_uid = required_str(&object, tags::SERIES_INSTANCE_UID)?;
        let sop_instance_uid = required_str(&object, tags::SOP_INSTANCE_UID)?;
        let hashes = hash_instance(&patient_id, &study_uid, &series_uid, &sop_instance_uid);

        if self
            .index
            .get_resource_by_public_id(&hashes.instance)
            .await?
            .is_some()
        {
            return Ok(StoreOutcome::AlreadyStored(receipt_from(&hashes)));
        }

        let mut written_blobs = Vec::new();
        match self
            .store_instance_inner(&object, remote_aet, &hashes, &mut written_blobs)
            .await
        {
            Ok(()) => Ok(StoreOutcome::Stored(receipt_from(&hashes))),
            Err(e) => {
                for blob in written_blobs {
                    let _ = self.content_store.remove(blob).await;
                }
                Err(e)
            }
        }
    }

    async fn store_instance_inner(
        &self,
        object: &DefaultDicomObject,
        remote_aet: &str,
        hashes: &ResourceHashes,
        written_blobs: &mut Vec<Uuid>,
    ) -> Result<()> {
        let (patient_id, patient_new) = self
            .index
            .create_resource(hashes.patient.clone(), ResourceType::Patient, None)
            .await?;
        let (study_id, study_new) = self
            .index
            .create_resource(hashes.study.clone(), ResourceType::Study, Some(patient_id))
            .await?;
        let (series_id, series_new) = self
            .index
            .create_resource(hashes.series.clone(), ResourceType::Series, Some(study_id))
            .await?;
        let (instance_id, _) = self
            .index
            .create_resource(hashes.instance.clone(), ResourceType::Instance, Some(series_id))
            .await?;

        self.index
            .set_main_dicom_tags(patient_id, main_tag_pairs(object, PATIENT_MAIN_TAGS))
            .await?;
        self.index
            .set_main_dicom_tags(study_id, main_tag_pairs(object, STUDY_MAIN_TAGS))
            .await?;
        self.index
            .set_main_dicom_tags(series_id, main_tag_pairs(object, SERIES_MAIN_TAGS))
            .await?;
        self.index
            .set_main_dicom_tags(instance_id, main_tag_pairs(object, INSTANCE_MAIN_TAGS))
            .await?;

        let compression = if self.config.storage_compression {
            CompressionKind::Zlib
        } else {
            CompressionKind::None
        };

        let mut dicom_bytes = Vec::new();
        object
            .write_all(&mut dicom_bytes)
            .map_err(|e| CoreError::BadFileFormat(e.to_string()))?;
        let dicom_uuid = self.content_store.create(&dicom_bytes).await?;
        written_blobs.push(dicom_uuid);
        let dicom_record = self
            .build_attachment_record(&dicom_bytes, ContentType::Dicom, compression, dicom_uuid)
            .await?;
        self.index.add_attachment(instance_id, dicom_record).await?;

        let json_value = dicom_bridge::to_json(object, dicom_bridge::DEFAULT_TOO_LONG_THRESHOLD);
        let json_bytes =
            serde_json::to_vec(&json_value).map_err(|e| CoreError::Internal(e.to_string()))?;
        let json_uuid = self.content_store.create(&json_bytes).await?;
        written_blobs.push(json_uuid);
        let json_record = self
            .build_attachment_record(&json_bytes, ContentType::DicomAsJson, compression, json_uuid)
            .await?;
        self.index.add_attachment(instance_id, json_record).await?;

        let now = Utc::now().to_rfc3339();
        self.index
            .set_metadata(instance_id, "RemoteAET".to_string(), remote_aet.to_string())
            .await?;
        self.index
            .set_metadata(instance_id, "ReceptionDate".to_string(), now.clone())
            .await?;
        if let Some(index_in_series) = element_string(object, tags::INSTANCE_NUMBER) {
            self.index
                .set_metadata(instance_id, "IndexInSeries".to_string(), index_in_series)
                .await?;
        }

        if patient_new {
            self.index
                .log_change(ChangeType::NewPatient, ResourceType::Patient, hashes.patient.clone(), now.clone())
                .await?;
        }
        if study_new {
            self.index
                .log_change(ChangeType::NewStudy, ResourceType::Study, hashes.study.clone(), now.clone())
                .await?;
        }
        if series_new {
            self.index
                .log_change(ChangeType::NewSeries, ResourceType::Series, hashes.series.clone(), now.clone())
                .await?;
        }
        self.index
            .log_change(ChangeType::NewInstance, ResourceType::Instance, hashes.instance.clone(), now)
            .await?;

        if !self.index.is_protected_patient(patient_id).await? {
            self.index.touch_patient(patient_id).await?;
        }

        self.enforce_storage_limits(patient_id).await?;

        Ok(())
    }

    async fn build_attachment_record(
        &self,
        bytes: &[u8],
        content_type: ContentType,
        compression: CompressionKind,
        uuid: Uuid,
    ) -> Result<AttachmentRecord> {
        let uncompressed_md5 = format!("{:x}", md5::compute(bytes));
        // The Content Store never hands back the post-compression bytes it
        // wrote, so the compressed digest is recomputed here rather than
        // read back; `content_store.size` is still the ground truth for
        // the on-disk size.
        let compressed_md5 = match compression {
            CompressionKind::None => uncompressed_md5.clone(),
            CompressionKind::Zlib => {
                use std::io::Write;
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(bytes)
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
                let compressed = encoder.finish().map_err(|e| CoreError::Internal(e.to_string()))?;
                format!("{:x}", md5::compute(&compressed))
            }
        };
        let compressed_size = self.content_store.size(uuid).await?;

        Ok(AttachmentRecord {
            uuid,
            content_type,
            uncompressed_size: bytes.len() as u64,
            uncompressed_md5,
            compression,
            compressed_size,
            compressed_md5,
        })
    }

    async fn enforce_storage_limits(&self, just_touched_patient: u64) -> Result<()> {
        loop {
            let stats = self.index.get_statistics().await?;
            let over_size = self.config.maximum_storage_size_mb > 0
                && stats.total_disk_size > self.config.maximum_storage_size_mb * 1024 * 1024;
            let over_count = self.config.maximum_patient_count > 0
                && stats.patient_count > self.config.maximum_patient_count;
            if !over_size && !over_count {
                return Ok(());
            }
            match self
                .index
                .select_patient_to_recycle(Some(just_touched_patient))
                .await?
            {
                Some(candidate) => {
                    self.delete_resource_by_id(candidate).await?;
                }
                None => return Err(CoreError::FullStorage),
            }
        }
    }

    // --- Read ---------------------------------------------------------------

    async fn read_attachment_by_resource_id(&self, id: u64, content_type: ContentType) -> Result<Vec<u8>> {
        let attachment = self
            .index
            .lookup_attachment(id, content_type)
            .await?
            .ok_or(CoreError::UnknownResource)?;
        Ok(self.content_store.read(attachment.uuid).await?)
    }

    pub async fn read_attachment(&self, public_id: &str, content_type: ContentType) -> Result<Vec<u8>> {
        let record = self
            .index
            .get_resource_by_public_id(public_id)
            .await?
            .ok_or(CoreError::UnknownResource)?;
        self.read_attachment_by_resource_id(record.id, content_type).await
    }

    /// Every content type currently attached to a resource (DICOM file,
    /// DICOM-as-JSON, and any user-defined attachments).
    pub async fn list_attachments(&self, public_id: &str) -> Result<Vec<ContentType>> {
        let record = self
            .index
            .get_resource_by_public_id(public_id)
            .await?
            .ok_or(CoreError::UnknownResource)?;
        Ok(self.index.list_attachments(record.id).await?)
    }

    /// Store a user-defined attachment, keyed by a content type outside the
    /// built-in DICOM/DICOM-as-JSON range. Mirrors Orthanc's
    /// `PUT /{resource}/{id}/attachments/{name}`, where `name` resolves
    /// through the `UserContentType` configuration map to a numeric type.
    pub async fn put_user_attachment(
        &self,
        public_id: &str,
        content_type: u16,
        bytes: &[u8],
    ) -> Result<AttachmentRecord> {
        let record = self
            .index
            .get_resource_by_public_id(public_id)
            .await?
            .ok_or(CoreError::UnknownResource)?;

        let compression = if self.config.storage_compression {
            CompressionKind::Zlib
        } else {
            CompressionKind::None
        };
        let uuid = self.content_store.create(bytes).await?;
        let attachment = self
            .build_attachment_record(bytes, ContentType::UserDefined(content_type), compression, uuid)
            .await?;
        self.index.add_attachment(record.id, attachment.clone()).await?;
        Ok(attachment)
    }

    pub async fn read_user_attachment(&self, public_id: &str, content_type: u16) -> Result<Vec<u8>> {
        self.read_attachment(public_id, ContentType::UserDefined(content_type)).await
    }

    // --- Metadata -------------------------------------------------------------

    async fn resolve_resource_id(&self, public_id: &str) -> Result<u64> {
        Ok(self
            .index
            .get_resource_by_public_id(public_id)
            .await?
            .ok_or(CoreError::UnknownResource)?
            .id)
    }

    pub async fn list_metadata(&self, public_id: &str) -> Result<Vec<String>> {
        let id = self.resolve_resource_id(public_id).await?;
        Ok(self.index.list_available_metadata(id).await?)
    }

    pub async fn get_metadata(&self, public_id: &str, metadata_type: &str) -> Result<Option<String>> {
        let id = self.resolve_resource_id(public_id).await?;
        Ok(self.index.get_metadata(id, metadata_type).await?)
    }

    pub async fn set_metadata(&self, public_id: &str, metadata_type: String, value: String) -> Result<()> {
        let id = self.resolve_resource_id(public_id).await?;
        Ok(self.index.set_metadata(id, metadata_type, value).await?)
    }

    pub async fn delete_metadata(&self, public_id: &str, metadata_type: &str) -> Result<bool> {
        let id = self.resolve_resource_id(public_id).await?;
        Ok(self.index.delete_metadata(id, metadata_type).await?)
    }

    /// A parsed, exclusively-held handle to an instance's dataset, built at
    /// most once per eviction cycle per instance.
    pub async fn get_parsed_instance(
        &self,
        public_id: &str,
    ) -> Result<OwnedMutexGuard<std::result::Result<DefaultDicomObject, String>>> {
        let record = self
            .index
            .get_resource_by_public_id(public_id)
            .await?
            .ok_or(CoreError::UnknownResource)?;
        if record.resource_type != ResourceType::Instance {
            return Err(CoreError::BadRequest("only instances can be parsed".to_string()));
        }
        let attachment = self
            .index
            .lookup_attachment(record.id, ContentType::Dicom)
            .await?
            .ok_or(CoreError::UnknownResource)?;
        let content_store = self.content_store.clone();
        let uuid = attachment.uuid;

        let guard = self
            .parsed_cache
            .access(public_id, move || async move {
                match content_store.read(uuid).await {
                    Ok(bytes) => dicom_object::from_reader(bytes.as_slice()).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;
        Ok(guard)
    }

    // --- Delete ---------------------------------------------------------------

    async fn delete_resource_by_id(&self, id: u64) -> Result<Option<RemainingAncestor>> {
        let record = self.index.get_resource(id).await?.ok_or(CoreError::UnknownResource)?;
        let outcome = self.index.delete_resource(id).await?;
        for attachment in &outcome.deleted_attachments {
            let _ = self.content_store.remove(attachment.uuid).await;
        }
        let change_type = match record.resource_type {
            ResourceType::Patient => ChangeType::DeletedPatient,
            ResourceType::Study => ChangeType::DeletedStudy,
            ResourceType::Series => ChangeType::DeletedSeries,
            ResourceType::Instance => ChangeType::DeletedInstance,
        };
        self.index
            .log_change(change_type, record.resource_type, record.public_id, Utc::now().to_rfc3339())
            .await?;
        Ok(outcome.remaining_ancestor)
    }

    pub async fn delete_resource(&self, public_id: &str) -> Result<Option<RemainingAncestor>> {
        let record = self
            .index
            .get_resource_by_public_id(public_id)
            .await?
            .ok_or(CoreError::UnknownResource)?;
        self.delete_resource_by_id(record.id).await
    }

    // --- Modify / anonymize -----------------------------------------------

    async fn collect_instance_ids(&self, id: u64, resource_type: ResourceType) -> Result<Vec<u64>> {
        if resource_type == ResourceType::Instance {
            return Ok(vec![id]);
        }
        let mut out = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for child in self.index.get_children(current).await? {
                match self.index.get_resource(child).await? {
                    Some(record) if record.resource_type == ResourceType::Instance => out.push(child),
                    Some(_) => frontier.push(child),
                    None => {}
                }
            }
        }
        Ok(out)
    }

    /// Apply `plan` to every instance under `public_id`, re-storing each as
    /// a new instance and recording lineage metadata at every level whose
    /// public id changed. `anonymize` only affects which change-log entry
    /// and lineage metadata key are used; the rewrite itself is driven
    /// entirely by `plan`.
    pub async fn apply_modification(
        &self,
        public_id: &str,
        plan: ModificationPlan,
        anonymize: bool,
        remote_aet: &str,
    ) -> Result<ModificationOutcome> {
        let resource = self
            .index
            .get_resource_by_public_id(public_id)
            .await?
            .ok_or(CoreError::UnknownResource)?;
        let instance_ids = self.collect_instance_ids(resource.id, resource.resource_type).await?;
        if instance_ids.is_empty() {
            return Err(CoreError::UnknownResource);
        }

        let metadata_type = if anonymize { "AnonymizedFrom" } else { "ModifiedFrom" };
        let mut engine = self.engine.lock().await;
        let mut outcome: Option<ModificationOutcome> = None;

        for instance_id in instance_ids {
            let dicom_bytes = self
                .read_attachment_by_resource_id(instance_id, ContentType::Dicom)
                .await?;
            let mut object = dicom_object::from_reader(dicom_bytes.as_slice())
                .map_err(|e| CoreError::BadFileFormat(e.to_string()))?;

            let old_hashes = hashes_of(&object)?;

            engine.apply(&plan, &mut object).map_err(CoreError::from)?;
            dicom_bridge::sync_media_storage_headers(&mut object).map_err(CoreError::from)?;

            let new_hashes = hashes_of(&object)?;

            // Orthanc never stores the rewritten file for an instance-level
            // request: it hands the transformed bytes straight back instead
            // of creating a new stored instance.
            let instance_bytes = if resource.resource_type == ResourceType::Instance {
                let mut buf = Vec::new();
                object
                    .write_all(&mut buf)
                    .map_err(|e| CoreError::BadFileFormat(e.to_string()))?;
                Some(buf)
            } else {
                self.store_instance(object, remote_aet).await?;
                None
            };

            if new_hashes.patient != old_hashes.patient {
                self.record_lineage(&new_hashes.patient, &old_hashes.patient, metadata_type).await?;
            }
            if new_hashes.study != old_hashes.study {
                self.record_lineage(&new_hashes.study, &old_hashes.study, metadata_type).await?;
            }
            if new_hashes.series != old_hashes.series {
                self.record_lineage(&new_hashes.series, &old_hashes.series, metadata_type).await?;
            }
            if instance_bytes.is_none() {
                self.record_lineage(&new_hashes.instance, &old_hashes.instance, metadata_type).await?;
            }

            if outcome.is_none() {
                let new_public_id = match resource.resource_type {
                    ResourceType::Patient => new_hashes.patient.clone(),
                    ResourceType::Study => new_hashes.study.clone(),
                    ResourceType::Series => new_hashes.series.clone(),
                    ResourceType::Instance => new_hashes.instance.clone(),
                };
                outcome = Some(ModificationOutcome {
                    resource_type: resource.resource_type,
                    path: resource_path(resource.resource_type, &new_public_id),
                    public_id: new_public_id,
                    patient_id: new_hashes.patient.clone(),
                    instance_bytes,
                });
            }
        }

        let outcome = outcome.ok_or(CoreError::UnknownResource)?;
        let target_level = resource_type_to_level(resource.resource_type);
        if let Some(change_type) = change_type_for(target_level, anonymize) {
            self.index
                .log_change(
                    change_type,
                    outcome.resource_type,
                    outcome.public_id.clone(),
                    Utc::now().to_rfc3339(),
                )
                .await?;
        }
        Ok(outcome)
    }

    async fn record_lineage(&self, new_public_id: &str, old_public_id: &str, metadata_type: &str) -> Result<()> {
        if let Some(record) = self.index.get_resource_by_public_id(new_public_id).await? {
            self.index
                .set_metadata(record.id, metadata_type.to_string(), old_public_id.to_string())
                .await?;
        }
        Ok(())
    }

    // --- Find / move ------------------------------------------------------

    async fn resolve_candidate_ids(&self, level: ResourceType, query: &InMemDicomObject) -> Result<Vec<u64>> {
        let query_map = DicomMap::from_object(query);
        let mut candidates: Option<HashSet<u64>> = None;
        for (tag, value) in query_map.iter() {
            let Some(s) = value.as_str() else { continue };
            let s = s.trim();
            if s.is_empty() || s.contains('*') || s.contains('?') {
                continue;
            }
            let matches: HashSet<u64> = self
                .index
                .lookup_tag_value(&tag_key(*tag), s)
                .await?
                .into_iter()
                .collect();
            candidates = Some(match candidates {
                Some(existing) => existing.intersection(&matches).copied().collect(),
                None => matches,
            });
        }
        let ids: Vec<u64> = match candidates {
            Some(ids) => ids.into_iter().collect(),
            None => self.index.list_by_type(level).await?,
        };

        let mut out = Vec::new();
        for id in ids {
            if let Some(record) = self.index.get_resource(id).await? {
                if record.resource_type == level {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    /// DICOM-level query/retrieve find: every resource of `level` matching
    /// the non-wildcard, non-empty keys in `query`, projected back to an
    /// answer dataset built from recorded main tags.
    pub async fn find_matches(&self, level: ResourceType, query: &InMemDicomObject) -> Result<Vec<InMemDicomObject>> {
        let ids = self.resolve_candidate_ids(level, query).await?;
        let mut answers = Vec::with_capacity(ids.len());
        for id in ids {
            let tags = self.index.get_main_dicom_tags(id).await?;
            let ops: Vec<MapOp> = tags
                .iter()
                .filter_map(|(key, value)| parse_tag_key(key).map(|t| MapOp::Replace(t, value.clone())))
                .collect();
            let mut answer = InMemDicomObject::from_element_iter(Vec::new());
            dicom_bridge::apply(&mut answer, &ops).map_err(CoreError::from)?;
            answers.push(answer);
        }
        Ok(answers)
    }

    /// Forward every instance matching `query` at `level` to `destination_aet`
    /// via C-STORE, tallying successes and failures into a `MoveReport`.
    pub async fn move_to(
        &self,
        level: ResourceType,
        query: &InMemDicomObject,
        destination_aet: &str,
    ) -> Result<MoveReport> {
        let modality = self
            .config
            .dicom_modalities
            .get(destination_aet)
            .ok_or_else(|| CoreError::BadRequest(format!("unknown destination AE title '{destination_aet}'")))?;
        let node = RemoteNode::new(modality.aet.clone(), modality.host.clone(), modality.port);

        let resource_ids = self.resolve_candidate_ids(level, query).await?;
        let mut instance_ids = Vec::new();
        for id in resource_ids {
            instance_ids.extend(self.collect_instance_ids(id, level).await?);
        }

        let scu = DimseScu::new(DimseConfig {
            local_aet: self.config.dicom_aet.clone(),
            ..Default::default()
        });

        let mut report = MoveReport::default();
        for instance_id in instance_ids {
            let outcome = match self.read_attachment_by_resource_id(instance_id, ContentType::Dicom).await {
                Ok(bytes) => scu.store(&node, DatasetStream::from_bytes(Bytes::from(bytes))).await,
                Err(e) => Err(dimse::DimseError::OperationFailed(e.to_string())),
            };
            match outcome {
                Ok(true) => {
                    report.completed += 1;
                    if let Some(record) = self.index.get_resource(instance_id).await? {
                        self.index
                            .log_export(
                                destination_aet.to_string(),
                                record.resource_type,
                                record.public_id,
                                Utc::now().to_rfc3339(),
                            )
                            .await?;
                    }
                }
                Ok(false) | Err(_) => report.failed += 1,
            }
        }
        Ok(report)
    }

    // --- Statistics / changes / exports -------------------------------------

    pub async fn get_changes(&self, since: u64, limit: Option<usize>) -> Result<Vec<ChangeRecord>> {
        let limit = limit.unwrap_or(100).clamp(1, 100);
        Ok(self.index.get_changes(since, limit).await?)
    }

    pub async fn get_last_change(&self) -> Result<Option<ChangeRecord>> {
        Ok(self.index.get_last_change().await?)
    }

    pub async fn clear_changes(&self) -> Result<()> {
        Ok(self.index.clear_changes().await?)
    }

    pub async fn get_exports(&self, since: u64, limit: Option<usize>) -> Result<Vec<crate::index::ExportRecord>> {
        let limit = limit.unwrap_or(100).clamp(1, 100);
        Ok(self.index.get_exports(since, limit).await?)
    }

    pub async fn clear_exports(&self) -> Result<()> {
        Ok(self.index.clear_exports().await?)
    }

    pub async fn statistics(&self) -> Result<Statistics> {
        Ok(self.index.get_statistics().await?)
    }
}

pub fn resource_type_to_level(resource_type: ResourceType) -> ResourceLevel {
    match resource_type {
        ResourceType::Patient => ResourceLevel::Patient,
        ResourceType::Study => ResourceLevel::Study,
        ResourceType::Series => ResourceLevel::Series,
        ResourceType::Instance => ResourceLevel::Instance,
    }
}

/// Maps a modification's declared level and whether it's an anonymization
/// onto the change types the index actually models. `ChangeType` has no
/// Instance-level or Patient-anonymization variant (mirroring how sparse
/// the upstream enum itself is); patient-level anonymization is logged as
/// `ModifiedPatient`, and an instance-level operation logs nothing here
/// since the re-store already logged a `NewInstance` entry.
fn change_type_for(level: ResourceLevel, anonymize: bool) -> Option<ChangeType> {
    match (level, anonymize) {
        (ResourceLevel::Patient, _) => Some(ChangeType::ModifiedPatient),
        (ResourceLevel::Study, false) => Some(ChangeType::ModifiedStudy),
        (ResourceLevel::Study, true) => Some(ChangeType::AnonymizedStudy),
        (ResourceLevel::Series, false) => Some(ChangeType::ModifiedSeries),
        (ResourceLevel::Series, true) => Some(ChangeType::AnonymizedSeries),
        (ResourceLevel::Instance, _) => None,
    }
}

fn receipt_from(hashes: &ResourceHashes) -> StoreReceipt {
    StoreReceipt {
        patient_id: hashes.patient.clone(),
        study_id: hashes.study.clone(),
        series_id: hashes.series.clone(),
        instance_id: hashes.instance.clone(),
    }
}

fn hashes_of(object: &InMemDicomObject) -> Result<ResourceHashes> {
    let patient_id = required_str(object, tags::PATIENT_ID)?;
    let study_uid = required_str(object, tags::STUDY_INSTANCE_UID)?;
    let series_uid = required_str(object, tags::SERIES_INSTANCE_UID)?;
    let sop_instance_uid = required_str(object, tags::SOP_INSTANCE_UID)?;
    Ok(hash_instance(&patient_id, &study_uid, &series_uid, &sop_instance_uid))
}

fn element_string(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

fn required_str(object: &InMemDicomObject, tag: Tag) -> Result<String> {
    element_string(object, tag).ok_or_else(|| CoreError::BadRequest(format!("missing required tag {tag:?}")))
}

fn main_tag_pairs(object: &InMemDicomObject, tag_list: &[Tag]) -> Vec<(String, String)> {
    tag_list
        .iter()
        .filter_map(|tag| element_string(object, *tag).map(|value| (tag_key(*tag), value)))
        .collect()
}

fn tag_key(tag: Tag) -> String {
    format!("{:04X}{:04X}", tag.group(), tag.element())
}

fn parse_tag_key(key: &str) -> Option<Tag> {
    if key.len() != 8 {
        return None;
    }
    let group = u16::from_str_radix(&key[0..4], 16).ok()?;
    let element = u16::from_str_radix(&key[4..8], 16).ok()?;
    Some(Tag(group, element))
}

/// Maps the DICOM query/retrieve level carried on the wire onto the
/// resource type the index stores (`Image` is DIMSE's name for `Instance`).
pub fn query_level_to_resource_type(level: QueryLevel) -> ResourceType {
    match level {
        QueryLevel::Patient => ResourceType::Patient,
        QueryLevel::Study => ResourceType::Study,
        QueryLevel::Series => ResourceType::Series,
        QueryLevel::Image => ResourceType::Instance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemContentStore;
    use dicom_core::{dicom_value, DataElement, VR};
    use tempfile::TempDir;

    async fn test_context() -> (TempDir, ServerContext) {
        let dir = TempDir::new().unwrap();
        let index = MetadataIndex::open(&dir.path().join("index.redb")).unwrap();
        let store = FilesystemContentStore::new(dir.path().join("storage"), CompressionKind::None).unwrap();
        let context = ServerContext::new(Arc::new(Config::default()), index, Arc::new(store));
        (dir, context)
    }

    fn sample_object(patient: &str, study: &str, series: &str, instance: &str) -> DefaultDicomObject {
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

    #[tokio::test]
    async fn storing_twice_reports_already_stored() {
        let (_dir, ctx) = test_context().await;
        let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
        let first = ctx.store_instance(object, "MODA").await.unwrap();
        assert!(matches!(first, StoreOutcome::Stored(_)));

        let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
        let second = ctx.store_instance(object, "MODA").await.unwrap();
        assert!(matches!(second, StoreOutcome::AlreadyStored(_)));
        assert_eq!(first.receipt(), second.receipt());
    }

    #[tokio::test]
    async fn stored_instance_is_readable_and_findable() {
        let (_dir, ctx) = test_context().await;
        let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
        let outcome = ctx.store_instance(object, "MODA").await.unwrap();
        let receipt = outcome.receipt().clone();

        let bytes = ctx
            .read_attachment(&receipt.instance_id, ContentType::Dicom)
            .await
            .unwrap();
        assert!(!bytes.is_empty());

        let mut query = InMemDicomObject::from_element_iter(Vec::new());
        dicom_bridge::apply(
            &mut query,
            &[MapOp::Replace(tags::PATIENT_ID, "P1".to_string())],
        )
        .unwrap();
        let matches = ctx.find_matches(ResourceType::Patient, &query).await.unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[tokio::test]
    async fn deleting_the_only_instance_removes_the_whole_chain() {
        let (_dir, ctx) = test_context().await;
        let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
        let outcome = ctx.store_instance(object, "MODA").await.unwrap();
        let receipt = outcome.receipt().clone();

        ctx.delete_resource(&receipt.instance_id).await.unwrap();
        assert!(ctx
            .index
            .get_resource_by_public_id(&receipt.patient_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn anonymizing_a_patient_produces_a_new_patient_id() {
        let (_dir, ctx) = test_context().await;
        let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
        let outcome = ctx.store_instance(object, "MODA").await.unwrap();
        let receipt = outcome.receipt().clone();

        let plan = ModificationPlan::anonymization_preset();
        let result = ctx
            .apply_modification(&receipt.patient_id, plan, true, "MODA")
            .await
            .unwrap();
        assert_ne!(result.patient_id, receipt.patient_id);
        assert_eq!(result.resource_type, ResourceType::Patient);
    }

    #[tokio::test]
    async fn parsed_instance_cache_returns_readable_dataset() {
        let (_dir, ctx) = test_context().await;
        let object = sample_object("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");
        let outcome = ctx.store_instance(object, "MODA").await.unwrap();
        let receipt = outcome.receipt().clone();

        let guard = ctx.get_parsed_instance(&receipt.instance_id).await.unwrap();
        let parsed = guard.as_ref().expect("attachment should parse");
        assert_eq!(
            parsed.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "P1"
        );
    }
}

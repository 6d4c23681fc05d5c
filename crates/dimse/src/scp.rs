//! Service Class Provider (SCP) implementation for inbound DIMSE associations.
//!
//! Handles the DICOM Upper Layer association state machine directly via
//! `dicom-ul`, dispatching C-ECHO, C-STORE, C-FIND and C-MOVE requests to
//! an [`AssociationHandler`] supplied by the caller (the server context).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::association::AsyncAssociation;
use dicom_ul::{association::ServerAssociationOptions, Pdu};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::DimseConfig;
use crate::types::QueryLevel;
use crate::{DimseError, Result};

const COMMAND_FIELD_C_STORE_RQ: u16 = 0x0001;
const COMMAND_FIELD_C_STORE_RSP: u16 = 0x8001;
const COMMAND_FIELD_C_FIND_RQ: u16 = 0x0020;
const COMMAND_FIELD_C_FIND_RSP: u16 = 0x8020;
const COMMAND_FIELD_C_MOVE_RQ: u16 = 0x0021;
const COMMAND_FIELD_C_MOVE_RSP: u16 = 0x8021;
const COMMAND_FIELD_C_ECHO_RQ: u16 = 0x0030;
const COMMAND_FIELD_C_ECHO_RSP: u16 = 0x8030;

const STATUS_SUCCESS: u16 = 0x0000;
const STATUS_PENDING: u16 = 0xFF00;
const STATUS_FAILURE: u16 = 0xA700;

/// Outcome of a single C-MOVE sub-operation loop.
#[derive(Debug, Clone, Default)]
pub struct MoveReport {
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
}

/// Receives dispatched DIMSE operations from an established association.
///
/// Implemented by the server context: the SCP only understands the wire
/// protocol, never resource semantics.
#[async_trait]
pub trait AssociationHandler: Send + Sync {
    /// Handle a C-ECHO-RQ. Almost always succeeds.
    async fn on_echo(&self, calling_aet: &str) -> Result<()>;

    /// Handle a single C-STORE-RQ. `object` carries the full dataset with
    /// file-meta information already attached.
    async fn on_store(&self, calling_aet: &str, object: DefaultDicomObject) -> Result<()>;

    /// Handle a C-FIND-RQ, returning zero or more matching identifiers to
    /// stream back as pending responses.
    async fn on_find(
        &self,
        calling_aet: &str,
        level: QueryLevel,
        identifier: InMemDicomObject,
    ) -> Result<Vec<InMemDicomObject>>;

    /// Handle a C-MOVE-RQ: locate matches and push each one as C-STORE to
    /// `destination_aet`, returning a final tally.
    async fn on_move(
        &self,
        calling_aet: &str,
        level: QueryLevel,
        destination_aet: &str,
        identifier: InMemDicomObject,
    ) -> Result<MoveReport>;
}

/// DICOM Upper Layer Service Class Provider.
pub struct DimseScp {
    config: DimseConfig,
    handler: Arc<dyn AssociationHandler>,
    active_associations: Arc<RwLock<u32>>,
}

impl DimseScp {
    pub fn new(config: DimseConfig, handler: Arc<dyn AssociationHandler>) -> Self {
        Self {
            config,
            handler,
            active_associations: Arc::new(RwLock::new(0)),
        }
    }

    /// Bind and serve associations until the process is terminated.
    pub async fn run(self) -> Result<()> {
        self.config.validate()?;

        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        info!(
            "DICOM SCP listening on {} (AET: {})",
            addr, self.config.local_aet
        );

        let scp = Arc::new(self);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    {
                        let active = scp.active_associations.read().await;
                        if *active >= scp.config.max_associations {
                            warn!("Maximum associations reached, rejecting {}", peer_addr);
                            drop(stream);
                            continue;
                        }
                    }

                    let scp = Arc::clone(&scp);
                    tokio::spawn(async move {
                        {
                            let mut active = scp.active_associations.write().await;
                            *active += 1;
                        }
                        if let Err(e) = scp.serve_association(stream, peer_addr).await {
                            error!("Association with {} failed: {}", peer_addr, e);
                        }
                        {
                            let mut active = scp.active_associations.write().await;
                            *active -= 1;
                        }
                    });
                }
                Err(e) => error!("Error accepting connection: {}", e),
            }
        }
    }

    async fn serve_association(
        &self,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let base_options = ServerAssociationOptions::new().ae_title(&self.config.local_aet).max_pdu_length(self.config.max_pdu);

        let mut association = if self.config.called_aet_check {
            finish_association_options(base_options.accept_called_ae_title(), stream)
                .await
                .map_err(|e| DimseError::AssociationRejected(e.to_string()))?
        } else {
            finish_association_options(base_options.accept_any(), stream)
                .await
                .map_err(|e| DimseError::AssociationRejected(e.to_string()))?
        };

        let calling_aet = association.client_ae_title().to_string();
        info!("New association from {} ({})", calling_aet, peer_addr);

        let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
        let mut pending_command: Option<InMemDicomObject> = None;
        let mut idle = Duration::ZERO;
        let poll_interval = Duration::from_secs(1);

        'association: loop {
            if idle >= self.config.idle_timeout() {
                warn!("Aborting idle association with {} after {:?}", calling_aet, idle);
                let _ = association.abort().await;
                break;
            }

            let received = match tokio::time::timeout(poll_interval, association.receive()).await {
                Err(_elapsed) => {
                    idle += poll_interval;
                    continue;
                }
                Ok(received) => {
                    idle = Duration::ZERO;
                    received
                }
            };

            match received {
                Ok(Pdu::PData { mut data }) => {
                    for value in data.drain(..) {
                        match (value.value_type, value.is_last) {
                            (PDataValueType::Command, true) => {
                                let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                    .erased();
                                let command =
                                    InMemDicomObject::read_dataset_with_ts(value.data.as_slice(), &ts)
                                        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
                                instance_buffer.clear();
                                pending_command = Some(command);
                            }
                            (PDataValueType::Command, false) => {
                                instance_buffer.extend_from_slice(&value.data);
                            }
                            (PDataValueType::Data, is_last) => {
                                instance_buffer.extend_from_slice(&value.data);
                                if is_last {
                                    let command = pending_command.take().ok_or_else(|| {
                                        DimseError::OperationFailed(
                                            "data PDV received with no pending command".into(),
                                        )
                                    })?;
                                    let outcome = self
                                        .dispatch(
                                            &mut association,
                                            &calling_aet,
                                            value.presentation_context_id,
                                            command,
                                            std::mem::take(&mut instance_buffer),
                                        )
                                        .await;
                                    if let Err(e) = outcome {
                                        warn!("Dispatch failed for {}: {}", calling_aet, e);
                                        break 'association;
                                    }
                                }
                            }
                        }
                    }
                }
                Ok(Pdu::ReleaseRQ) => {
                    let _ = association.send(&Pdu::ReleaseRP).await;
                    info!("Released association with {}", calling_aet);
                    break;
                }
                Ok(Pdu::AbortRQ { source }) => {
                    warn!("Association aborted by {}: {:?}", calling_aet, source);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Association with {} ended: {}", calling_aet, e);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        association: &mut dicom_ul::association::server::AsyncServerAssociation<tokio::net::TcpStream>,
        calling_aet: &str,
        pc_id: u8,
        command: InMemDicomObject,
        dataset_bytes: Vec<u8>,
    ) -> Result<()> {
        let command_field = command
            .element(tags::COMMAND_FIELD)
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .uint16()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;
        let message_id = command
            .element(tags::MESSAGE_ID)
            .map_err(|e| DimseError::DicomObject(e.to_string()))?
            .to_int::<u16>()
            .map_err(|e| DimseError::DicomObject(e.to_string()))?;

        match command_field {
            COMMAND_FIELD_C_ECHO_RQ => {
                let result = self.handler.on_echo(calling_aet).await;
                let status = if result.is_ok() { STATUS_SUCCESS } else { STATUS_FAILURE };
                let rsp = simple_response(COMMAND_FIELD_C_ECHO_RSP, message_id, status, None, None);
                send_command(association, pc_id, rsp).await
            }
            COMMAND_FIELD_C_STORE_RQ => {
                let pc = association
                    .presentation_contexts()
                    .iter()
                    .find(|pc| pc.id == pc_id)
                    .ok_or_else(|| DimseError::OperationFailed("missing presentation context".into()))?;
                let ts = TransferSyntaxRegistry
                    .get(&pc.transfer_syntax)
                    .ok_or_else(|| DimseError::DicomParsing("unsupported transfer syntax".into()))?;
                let object = InMemDicomObject::read_dataset_with_ts(dataset_bytes.as_slice(), ts)
                    .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

                let sop_class_uid = element_str(&object, tags::SOP_CLASS_UID)?;
                let sop_instance_uid = element_str(&object, tags::SOP_INSTANCE_UID)?;
                let file_meta = FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid(sop_class_uid.as_str())
                    .media_storage_sop_instance_uid(sop_instance_uid.as_str())
                    .transfer_syntax(&pc.transfer_syntax)
                    .build()
                    .map_err(|e| DimseError::DicomObject(e.to_string()))?;
                let file_obj = object.with_exact_meta(file_meta);

                let status = match self.handler.on_store(calling_aet, file_obj).await {
                    Ok(()) => STATUS_SUCCESS,
                    Err(e) => {
                        warn!("C-STORE failed: {}", e);
                        STATUS_FAILURE
                    }
                };
                let rsp = simple_response(
                    COMMAND_FIELD_C_STORE_RSP,
                    message_id,
                    status,
                    Some(sop_class_uid),
                    Some(sop_instance_uid),
                );
                send_command(association, pc_id, rsp).await
            }
            COMMAND_FIELD_C_FIND_RQ => {
                if !self.config.is_aet_known(calling_aet) {
                    warn!("Rejecting C-FIND from unknown AE title {}", calling_aet);
                    let rsp = simple_response(COMMAND_FIELD_C_FIND_RSP, message_id, STATUS_FAILURE, None, None);
                    return send_command(association, pc_id, rsp).await;
                }
                let pc = association
                    .presentation_contexts()
                    .iter()
                    .find(|pc| pc.id == pc_id)
                    .ok_or_else(|| DimseError::OperationFailed("missing presentation context".into()))?;
                let ts = TransferSyntaxRegistry
                    .get(&pc.transfer_syntax)
                    .ok_or_else(|| DimseError::DicomParsing("unsupported transfer syntax".into()))?;
                let identifier = InMemDicomObject::read_dataset_with_ts(dataset_bytes.as_slice(), ts)
                    .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
                let level = query_retrieve_level(&identifier)?;

                let matches = self
                    .handler
                    .on_find(calling_aet, level, identifier)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("C-FIND failed: {}", e);
                        Vec::new()
                    });

                for m in &matches {
                    let rsp = simple_response(COMMAND_FIELD_C_FIND_RSP, message_id, STATUS_PENDING, None, None);
                    send_command(association, pc_id, rsp).await?;
                    send_dataset(association, pc_id, m, ts.uid()).await?;
                }
                let rsp = simple_response(COMMAND_FIELD_C_FIND_RSP, message_id, STATUS_SUCCESS, None, None);
                send_command(association, pc_id, rsp).await
            }
            COMMAND_FIELD_C_MOVE_RQ => {
                if !self.config.is_aet_known(calling_aet) {
                    warn!("Rejecting C-MOVE from unknown AE title {}", calling_aet);
                    let rsp = move_response(message_id, STATUS_FAILURE, MoveReport { failed: 1, ..Default::default() });
                    return send_command(association, pc_id, rsp).await;
                }
                let pc = association
                    .presentation_contexts()
                    .iter()
                    .find(|pc| pc.id == pc_id)
                    .ok_or_else(|| DimseError::OperationFailed("missing presentation context".into()))?;
                let ts = TransferSyntaxRegistry
                    .get(&pc.transfer_syntax)
                    .ok_or_else(|| DimseError::DicomParsing("unsupported transfer syntax".into()))?;
                let identifier = InMemDicomObject::read_dataset_with_ts(dataset_bytes.as_slice(), ts)
                    .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
                let level = query_retrieve_level(&identifier)?;
                let destination_aet = command
                    .element(tags::MOVE_DESTINATION)
                    .map_err(|e| DimseError::DicomObject(e.to_string()))?
                    .to_str()
                    .map_err(|e| DimseError::DicomObject(e.to_string()))?
                    .trim_end_matches('\0')
                    .to_string();

                let report = self
                    .handler
                    .on_move(calling_aet, level, &destination_aet, identifier)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("C-MOVE failed: {}", e);
                        MoveReport { failed: 1, ..Default::default() }
                    });

                let status = if report.failed > 0 { STATUS_FAILURE } else { STATUS_SUCCESS };
                let rsp = move_response(message_id, status, report);
                send_command(association, pc_id, rsp).await
            }
            other => Err(DimseError::NotSupported(format!("command field 0x{:04X}", other))),
        }
    }
}

async fn finish_association_options<A>(
    mut options: ServerAssociationOptions<'_, A>,
    stream: tokio::net::TcpStream,
) -> std::result::Result<dicom_ul::association::server::AsyncServerAssociation<tokio::net::TcpStream>, dicom_ul::association::Error>
where
    A: dicom_ul::association::server::AccessControl,
{
    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }
    for uid in storage_sop_classes() {
        options = options.with_abstract_syntax(*uid);
    }
    for uid in query_retrieve_sop_classes() {
        options = options.with_abstract_syntax(*uid);
    }
    options = options.with_abstract_syntax(dicom_dictionary_std::uids::VERIFICATION);
    options.establish_async(stream).await
}

fn element_str(object: &InMemDicomObject, tag: Tag) -> Result<String> {
    Ok(object
        .element(tag)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .trim_end_matches('\0')
        .to_string())
}

fn query_retrieve_level(identifier: &InMemDicomObject) -> Result<QueryLevel> {
    let raw = identifier
        .element(tags::QUERY_RETRIEVE_LEVEL)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .trim_end_matches('\0')
        .to_string();
    raw.parse()
}

fn simple_response(
    command_field: u16,
    message_id: u16,
    status: u16,
    sop_class_uid: Option<String>,
    sop_instance_uid: Option<String>,
) -> InMemDicomObject<StandardDataDictionary> {
    let mut elements = vec![
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ];
    if let Some(uid) = sop_class_uid {
        elements.push(DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uid)));
    }
    if let Some(uid) = sop_instance_uid {
        elements.push(DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, uid)));
    }
    InMemDicomObject::command_from_element_iter(elements)
}

fn move_response(
    message_id: u16,
    status: u16,
    report: MoveReport,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [COMMAND_FIELD_C_MOVE_RSP]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [report.completed as u16]),
        ),
        DataElement::new(
            tags::NUMBER_OF_FAILED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [report.failed as u16]),
        ),
        DataElement::new(
            tags::NUMBER_OF_WARNING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [report.warning as u16]),
        ),
    ])
}

async fn send_command(
    association: &mut dicom_ul::association::server::AsyncServerAssociation<tokio::net::TcpStream>,
    pc_id: u8,
    command: InMemDicomObject<StandardDataDictionary>,
) -> Result<()> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, &ts)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    };
    association
        .send(&pdu)
        .await
        .map_err(|e| DimseError::DicomUl(e.to_string()))
}

async fn send_dataset(
    association: &mut dicom_ul::association::server::AsyncServerAssociation<tokio::net::TcpStream>,
    pc_id: u8,
    object: &InMemDicomObject,
    ts_uid: &str,
) -> Result<()> {
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .ok_or_else(|| DimseError::DicomParsing("unsupported transfer syntax".into()))?;
    let mut data = Vec::new();
    object
        .write_dataset_with_ts(&mut data, ts)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Data,
            is_last: true,
            data,
        }],
    };
    association
        .send(&pdu)
        .await
        .map_err(|e| DimseError::DicomUl(e.to_string()))
}

#[allow(deprecated)]
pub(crate) fn storage_sop_classes() -> &'static [&'static str] {
    use dicom_dictionary_std::uids::*;
    &[
        CT_IMAGE_STORAGE,
        MR_IMAGE_STORAGE,
        SECONDARY_CAPTURE_IMAGE_STORAGE,
        ULTRASOUND_IMAGE_STORAGE_RETIRED,
        COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
        DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
        NUCLEAR_MEDICINE_IMAGE_STORAGE,
        POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
        ENCAPSULATED_PDF_STORAGE,
        GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
        BASIC_TEXT_SR_STORAGE,
    ]
}

pub(crate) fn query_retrieve_sop_classes() -> &'static [&'static str] {
    &[
        "1.2.840.10008.5.1.4.1.2.1.1", // Patient Root Query/Retrieve Information Model - FIND
        "1.2.840.10008.5.1.4.1.2.1.2", // Patient Root Query/Retrieve Information Model - MOVE
        "1.2.840.10008.5.1.4.1.2.2.1", // Study Root Query/Retrieve Information Model - FIND
        "1.2.840.10008.5.1.4.1.2.2.2", // Study Root Query/Retrieve Information Model - MOVE
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct NullHandler;

    #[async_trait]
    impl AssociationHandler for NullHandler {
        async fn on_echo(&self, _calling_aet: &str) -> Result<()> {
            Ok(())
        }
        async fn on_store(&self, _calling_aet: &str, _object: DefaultDicomObject) -> Result<()> {
            Ok(())
        }
        async fn on_find(
            &self,
            _calling_aet: &str,
            _level: QueryLevel,
            _identifier: InMemDicomObject,
        ) -> Result<Vec<InMemDicomObject>> {
            Ok(vec![])
        }
        async fn on_move(
            &self,
            _calling_aet: &str,
            _level: QueryLevel,
            _destination_aet: &str,
            _identifier: InMemDicomObject,
        ) -> Result<MoveReport> {
            Ok(MoveReport::default())
        }
    }

    #[test]
    fn test_scp_creation() {
        let config = DimseConfig {
            local_aet: "TEST_SCP".to_string(),
            bind_addr: std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 0,
            ..Default::default()
        };
        let scp = DimseScp::new(config, Arc::new(NullHandler));
        assert_eq!(scp.config.local_aet, "TEST_SCP");
    }

    #[test]
    fn test_simple_response_status() {
        let rsp = simple_response(COMMAND_FIELD_C_ECHO_RSP, 7, STATUS_SUCCESS, None, None);
        let status = rsp.element(tags::STATUS).unwrap().to_int::<u16>().unwrap();
        assert_eq!(status, STATUS_SUCCESS);
    }
}

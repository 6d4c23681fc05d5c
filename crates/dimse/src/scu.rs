//! Service Class User (SCU) implementation for outbound DIMSE operations.
//!
//! Drives `dicom-ul`'s async client association state machine directly,
//! the same library scp.rs drives on the accepting side, just from the
//! calling end.

use std::collections::HashMap;
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_core::DataDictionary;
use dicom_dictionary_std::{tags, uids, StandardDataDictionary};
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::association::client::AsyncClientAssociation;
use dicom_ul::association::AsyncAssociation;
use dicom_ul::{ClientAssociationOptions, Pdu};
use futures::stream::Stream;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DimseConfig, RemoteNode};
use crate::types::{DatasetStream, FindQuery, MoveQuery, QueryLevel};
use crate::{DimseError, Result};

const COMMAND_FIELD_C_ECHO_RQ: u16 = 0x0030;
const COMMAND_FIELD_C_STORE_RQ: u16 = 0x0001;
const COMMAND_FIELD_C_FIND_RQ: u16 = 0x0020;
const COMMAND_FIELD_C_MOVE_RQ: u16 = 0x0021;

const STATUS_SUCCESS: u16 = 0x0000;
const STATUS_PENDING_A: u16 = 0xFF00;
const STATUS_PENDING_B: u16 = 0xFF01;

const PATIENT_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
const PATIENT_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

/// DIMSE Service Class User
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    async fn associate(
        &self,
        node: &RemoteNode,
        abstract_syntax: &str,
        transfer_syntaxes: Vec<&str>,
    ) -> Result<AsyncClientAssociation<TcpStream>> {
        let addr = format!("{}:{}", node.host, node.port);
        let max_pdu = self.get_max_pdu(node);
        debug!("Associating with {}@{} (max_pdu={})", node.ae_title, addr, max_pdu);
        ClientAssociationOptions::new()
            .calling_ae_title(&self.config.local_aet)
            .called_ae_title(&node.ae_title)
            .max_pdu_length(max_pdu)
            .with_presentation_context(abstract_syntax, transfer_syntaxes)
            .establish_with_async(&addr)
            .await
            .map_err(|e| DimseError::AssociationRejected(e.to_string()))
    }

    /// Send a C-ECHO request to a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<bool> {
        node.validate()?;
        info!("Sending C-ECHO to {}@{}:{}", node.ae_title, node.host, node.port);

        let mut association = self.associate(node, uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN]).await?;
        let pc_id = first_presentation_context(&association)?;

        let command = echo_req_command(1);
        send_command(&mut association, pc_id, &command).await?;

        let (rsp, _dataset) = receive_response(&mut association).await?;
        let status = command_status(&rsp)?;
        let _ = association.release().await;

        if status == STATUS_SUCCESS {
            info!("C-ECHO completed successfully");
        } else {
            warn!("C-ECHO returned non-success status 0x{:04X}", status);
        }
        Ok(status == STATUS_SUCCESS)
    }

    /// Send a C-FIND request to a remote node
    pub async fn find(
        &self,
        node: &RemoteNode,
        query: FindQuery,
    ) -> Result<impl Stream<Item = Result<DatasetStream>>> {
        node.validate()?;
        info!(
            "Sending C-FIND to {}@{}:{} (level: {}, max_results: {})",
            node.ae_title, node.host, node.port, query.query_level, query.max_results
        );
        debug!("C-FIND query parameters: {:?}", query.parameters);

        let abstract_syntax = match query.query_level {
            QueryLevel::Patient => PATIENT_ROOT_FIND,
            _ => STUDY_ROOT_FIND,
        };
        let preferred = self.config.preferred_transfer_syntaxes.clone();
        let ts_refs: Vec<&str> = preferred.iter().map(String::as_str).collect();
        let mut association = self.associate(node, abstract_syntax, ts_refs).await?;
        let pc_id = first_presentation_context(&association)?;
        let ts_uid = association
            .presentation_contexts()
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| pc.transfer_syntax.clone())
            .ok_or_else(|| DimseError::AssociationRejected("no presentation context accepted".into()))?;

        let identifier = identifier_from_parameters(query.query_level, &query.parameters)?;
        let command = find_req_command(abstract_syntax, 1);
        send_command(&mut association, pc_id, &command).await?;
        send_dataset(&mut association, pc_id, &identifier, &ts_uid).await?;

        let (tx, rx) = mpsc::channel(32);
        let max_results = query.max_results;
        tokio::spawn(async move {
            let mut delivered = 0u32;
            loop {
                let (rsp, dataset) = match receive_response(&mut association).await {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                let status = match command_status(&rsp) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                if status == STATUS_PENDING_A || status == STATUS_PENDING_B {
                    if let Some(bytes) = dataset {
                        let ts = match TransferSyntaxRegistry.get(&ts_uid) {
                            Some(ts) => ts,
                            None => {
                                let _ = tx
                                    .send(Err(DimseError::DicomParsing(format!("unsupported transfer syntax {}", ts_uid))))
                                    .await;
                                break;
                            }
                        };
                        match InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts) {
                            Ok(object) => {
                                delivered += 1;
                                if tx.send(Ok(DatasetStream::from_object(object))).await.is_err() {
                                    break;
                                }
                                if max_results != 0 && delivered >= max_results {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(DimseError::DicomParsing(e.to_string()))).await;
                                break;
                            }
                        }
                    }
                    continue;
                }
                if status != STATUS_SUCCESS {
                    warn!("C-FIND returned non-success final status 0x{:04X}", status);
                }
                break;
            }
            let _ = association.release().await;
        });

        Ok(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    /// Send a C-MOVE request to a remote node. Matching instances arrive
    /// over a separate inbound association to this node's own SCP, so the
    /// stream this returns is always empty on success; it exists purely to
    /// keep the same return shape as `find`, while the final move
    /// status/count is surfaced through the ordinary error path.
    pub async fn move_request(
        &self,
        node: &RemoteNode,
        query: MoveQuery,
    ) -> Result<impl Stream<Item = Result<DatasetStream>>> {
        node.validate()?;
        info!(
            "Sending C-MOVE to {}@{}:{} (level: {}, dest: {})",
            node.ae_title, node.host, node.port, query.query_level, query.destination_aet
        );
        debug!("C-MOVE query parameters: {:?}", query.parameters);

        let abstract_syntax = match query.query_level {
            QueryLevel::Patient => PATIENT_ROOT_MOVE,
            _ => STUDY_ROOT_MOVE,
        };
        let preferred = self.config.preferred_transfer_syntaxes.clone();
        let ts_refs: Vec<&str> = preferred.iter().map(String::as_str).collect();
        let mut association = self.associate(node, abstract_syntax, ts_refs).await?;
        let pc_id = first_presentation_context(&association)?;
        let ts_uid = association
            .presentation_contexts()
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| pc.transfer_syntax.clone())
            .ok_or_else(|| DimseError::AssociationRejected("no presentation context accepted".into()))?;

        let identifier = identifier_from_parameters(query.query_level, &query.parameters)?;
        let command = move_req_command(abstract_syntax, 1, &query.destination_aet);
        send_command(&mut association, pc_id, &command).await?;
        send_dataset(&mut association, pc_id, &identifier, &ts_uid).await?;

        let mut final_status = STATUS_PENDING_A;
        while final_status == STATUS_PENDING_A || final_status == STATUS_PENDING_B {
            let (rsp, _dataset) = receive_response(&mut association).await?;
            final_status = command_status(&rsp)?;
        }
        let _ = association.release().await;

        let (_tx, rx) = mpsc::channel::<Result<DatasetStream>>(1);
        if final_status == STATUS_SUCCESS {
            debug!("C-MOVE completed");
            Ok(tokio_stream::wrappers::ReceiverStream::new(rx))
        } else {
            Err(DimseError::operation_failed(format!("C-MOVE finished with status 0x{:04X}", final_status)))
        }
    }

    /// Send a C-STORE request to a remote node
    pub async fn store(&self, node: &RemoteNode, dataset: DatasetStream) -> Result<bool> {
        node.validate()?;
        info!("Sending C-STORE to {}@{}:{}", node.ae_title, node.host, node.port);
        debug!("C-STORE dataset: id={}", dataset.metadata().id);

        let object = dataset.to_object().await?;
        let sop_class_uid = element_str(&object, tags::SOP_CLASS_UID)?;
        let sop_instance_uid = element_str(&object, tags::SOP_INSTANCE_UID)?;

        let mut preferred = self.config.preferred_transfer_syntaxes.clone();
        if let Some(ts) = dataset.metadata().transfer_syntax.clone() {
            if !preferred.contains(&ts) {
                preferred.insert(0, ts);
            }
        }
        let ts_refs: Vec<&str> = preferred.iter().map(String::as_str).collect();

        let mut association = self.associate(node, &sop_class_uid, ts_refs).await?;
        let pc = association
            .presentation_contexts()
            .first()
            .cloned()
            .ok_or_else(|| DimseError::AssociationRejected("no presentation context accepted".into()))?;
        let ts = TransferSyntaxRegistry
            .get(&pc.transfer_syntax)
            .ok_or_else(|| DimseError::DicomParsing(format!("unsupported transfer syntax {}", pc.transfer_syntax)))?;

        let command = store_req_command(&sop_class_uid, &sop_instance_uid, 1);
        let mut cmd_data = Vec::new();
        command
            .write_dataset_with_ts(&mut cmd_data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
        let mut object_data = Vec::new();
        object
            .write_dataset_with_ts(&mut object_data, ts)
            .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

        let nbytes = cmd_data.len() + object_data.len();
        if nbytes < (association.acceptor_max_pdu_length() as usize).saturating_sub(100) {
            let pdu = Pdu::PData {
                data: vec![
                    PDataValue {
                        presentation_context_id: pc.id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: cmd_data,
                    },
                    PDataValue {
                        presentation_context_id: pc.id,
                        value_type: PDataValueType::Data,
                        is_last: true,
                        data: object_data,
                    },
                ],
            };
            association.send(&pdu).await.map_err(|e| DimseError::DicomUl(e.to_string()))?;
        } else {
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc.id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: cmd_data,
                }],
            };
            association.send(&pdu).await.map_err(|e| DimseError::DicomUl(e.to_string()))?;
            let mut pdata = association.send_pdata(pc.id).await;
            pdata.write_all(&object_data).await.map_err(DimseError::Network)?;
        }

        let (rsp, _dataset) = receive_response(&mut association).await?;
        let status = command_status(&rsp)?;
        let _ = association.release().await;

        if status == STATUS_SUCCESS {
            info!("C-STORE completed successfully");
            Ok(true)
        } else {
            warn!("C-STORE returned non-success status 0x{:04X}", status);
            Ok(false)
        }
    }

    /// Test connectivity to a remote node with retry logic
    pub async fn test_connection(&self, node: &RemoteNode, max_retries: u32) -> Result<bool> {
        let mut retries = 0;

        while retries <= max_retries {
            if retries > 0 {
                info!("Connection test retry {} of {}", retries, max_retries);
                tokio::time::sleep(Duration::from_secs(1 << retries)).await; // Exponential backoff
            }

            match self.echo(node).await {
                Ok(_) => {
                    info!("Connection test successful");
                    return Ok(true);
                }
                Err(e) if e.is_recoverable() && retries < max_retries => {
                    warn!("Connection test failed (attempt {}): {}", retries + 1, e);
                    retries += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(DimseError::operation_failed("Connection test failed after all retries"))
    }

    /// Get connection timeout for a node (uses node-specific or global setting)
    #[allow(dead_code)]
    fn get_connection_timeout(&self, node: &RemoteNode) -> Duration {
        node.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout())
    }

    /// Get maximum PDU size for a node (uses node-specific or global setting)
    fn get_max_pdu(&self, node: &RemoteNode) -> u32 {
        node.max_pdu.unwrap_or(self.config.max_pdu)
    }
}

fn first_presentation_context(association: &AsyncClientAssociation<TcpStream>) -> Result<u8> {
    association
        .presentation_contexts()
        .first()
        .map(|pc| pc.id)
        .ok_or_else(|| DimseError::AssociationRejected("no presentation context accepted".into()))
}

fn element_str(object: &InMemDicomObject, tag: dicom_core::Tag) -> Result<String> {
    Ok(object
        .element(tag)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .to_str()
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .trim_end_matches('\0')
        .to_string())
}

fn command_status(command: &InMemDicomObject<StandardDataDictionary>) -> Result<u16> {
    command
        .element(tags::STATUS)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .to_int::<u16>()
        .map_err(|e| DimseError::DicomObject(e.to_string()))
}

async fn send_command(
    association: &mut AsyncClientAssociation<TcpStream>,
    pc_id: u8,
    command: &InMemDicomObject<StandardDataDictionary>,
) -> Result<()> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
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
    association.send(&pdu).await.map_err(|e| DimseError::DicomUl(e.to_string()))
}

async fn send_dataset(
    association: &mut AsyncClientAssociation<TcpStream>,
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
    association.send(&pdu).await.map_err(|e| DimseError::DicomUl(e.to_string()))
}

/// Receive one response: the command set, plus an accompanying dataset if
/// `CommandDataSetType` says one follows (used for C-FIND matches and
/// C-MOVE sub-operation detail, never for C-ECHO/C-STORE responses).
async fn receive_response(
    association: &mut AsyncClientAssociation<TcpStream>,
) -> Result<(InMemDicomObject<StandardDataDictionary>, Option<Vec<u8>>)> {
    let mut pending_command: Option<InMemDicomObject<StandardDataDictionary>> = None;
    let mut instance_buffer: Vec<u8> = Vec::new();

    loop {
        match association.receive().await.map_err(|e| DimseError::DicomUl(e.to_string()))? {
            Pdu::PData { mut data } => {
                for value in data.drain(..) {
                    match (value.value_type, value.is_last) {
                        (PDataValueType::Command, true) => {
                            let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
                            let command = InMemDicomObject::read_dataset_with_ts(value.data.as_slice(), &ts)
                                .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
                            let carries_dataset = command
                                .element(tags::COMMAND_DATA_SET_TYPE)
                                .ok()
                                .and_then(|e| e.to_int::<u16>().ok())
                                .map(|v| v != 0x0101)
                                .unwrap_or(false);
                            if !carries_dataset {
                                return Ok((command, None));
                            }
                            instance_buffer.clear();
                            pending_command = Some(command);
                        }
                        (PDataValueType::Command, false) => instance_buffer.extend_from_slice(&value.data),
                        (PDataValueType::Data, is_last) => {
                            instance_buffer.extend_from_slice(&value.data);
                            if is_last {
                                let command = pending_command.take().ok_or_else(|| {
                                    DimseError::OperationFailed("data PDV received with no pending command".into())
                                })?;
                                return Ok((command, Some(std::mem::take(&mut instance_buffer))));
                            }
                        }
                    }
                }
            }
            other => {
                return Err(DimseError::OperationFailed(format!(
                    "unexpected PDU while awaiting response: {:?}",
                    other
                )))
            }
        }
    }
}

fn echo_req_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_ECHO_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
    ])
}

fn find_req_command(abstract_syntax: &str, message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, abstract_syntax.to_string())),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_FIND_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0001])),
    ])
}

fn move_req_command(
    abstract_syntax: &str,
    message_id: u16,
    destination_aet: &str,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, abstract_syntax.to_string())),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_MOVE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, destination_aet.to_string())),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0001])),
    ])
}

fn store_req_command(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid.to_string())),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid.to_string())),
    ])
}

/// Build a C-FIND/C-MOVE identifier from query-level + free-form keys.
/// Keys are either an 8-hex-digit tag (`"00100020"`) or one of the common
/// keywords the query builders in `types.rs` populate; unresolvable keys
/// are dropped.
fn identifier_from_parameters(level: QueryLevel, parameters: &HashMap<String, String>) -> Result<InMemDicomObject> {
    let mut elements = vec![DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, level.to_string()),
    )];
    for (key, value) in parameters {
        match resolve_tag(key) {
            Some(tag) => {
                let vr = StandardDataDictionary.by_tag(tag).map(|e| e.vr.relaxed()).unwrap_or(VR::LO);
                elements.push(DataElement::new(tag, vr, dicom_value!(Str, value.clone())));
            }
            None => warn!("Dropping unresolvable C-FIND/C-MOVE key '{}'", key),
        }
    }
    Ok(InMemDicomObject::from_element_iter(elements))
}

fn resolve_tag(key: &str) -> Option<dicom_core::Tag> {
    if key.len() == 8 && key.chars().all(|c| c.is_ascii_hexdigit()) {
        let group = u16::from_str_radix(&key[0..4], 16).ok()?;
        let element = u16::from_str_radix(&key[4..8], 16).ok()?;
        return Some(dicom_core::Tag(group, element));
    }
    match key {
        "PatientID" => Some(tags::PATIENT_ID),
        "PatientName" => Some(tags::PATIENT_NAME),
        "StudyInstanceUID" => Some(tags::STUDY_INSTANCE_UID),
        "SeriesInstanceUID" => Some(tags::SERIES_INSTANCE_UID),
        "SOPInstanceUID" => Some(tags::SOP_INSTANCE_UID),
        "AccessionNumber" => Some(tags::ACCESSION_NUMBER),
        "StudyDate" => Some(tags::STUDY_DATE),
        "Modality" => Some(tags::MODALITY),
        "StudyDescription" => Some(tags::STUDY_DESCRIPTION),
        "SeriesDescription" => Some(tags::SERIES_DESCRIPTION),
        _ => None,
    }
}

/// Builder for creating SCU instances with custom configurations
pub struct ScuBuilder {
    config: DimseConfig,
}

impl ScuBuilder {
    /// Start building a new SCU
    pub fn new() -> Self {
        Self {
            config: DimseConfig::default(),
        }
    }

    /// Set the local AE title
    pub fn local_aet(mut self, aet: impl Into<String>) -> Self {
        self.config.local_aet = aet.into();
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum PDU size
    pub fn max_pdu(mut self, size: u32) -> Self {
        self.config.max_pdu = size;
        self
    }

    /// Build the SCU
    pub fn build(self) -> Result<DimseScu> {
        self.config.validate()?;
        Ok(DimseScu::new(self.config))
    }
}

impl Default for ScuBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scu_creation() {
        let scu = ScuBuilder::new()
            .local_aet("TEST_SCU")
            .connection_timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        assert_eq!(scu.config.local_aet, "TEST_SCU");
        assert_eq!(scu.config.connect_timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_connection_timeout_selection() {
        let scu = DimseScu::new(DimseConfig {
            connect_timeout_ms: 5000,
            ..Default::default()
        });

        // Node without specific timeout should use global
        let node1 = RemoteNode::new("TEST1", "localhost", 11112);
        assert_eq!(scu.get_connection_timeout(&node1), Duration::from_millis(5000));

        // Node with specific timeout should use its own
        let node2 = RemoteNode::new("TEST2", "localhost", 11113).with_timeout(2000);
        assert_eq!(scu.get_connection_timeout(&node2), Duration::from_millis(2000));
    }

    #[test]
    fn test_invalid_config_validation() {
        let result = ScuBuilder::new()
            .local_aet("") // Invalid empty AE title
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_tag_hex_and_name() {
        assert_eq!(resolve_tag("00100020"), Some(tags::PATIENT_ID));
        assert_eq!(resolve_tag("PatientID"), Some(tags::PATIENT_ID));
        assert_eq!(resolve_tag("NotARealKeyword"), None);
    }

    #[test]
    fn test_identifier_from_parameters() {
        let mut params = HashMap::new();
        params.insert("PatientID".to_string(), "12345".to_string());
        let identifier = identifier_from_parameters(QueryLevel::Patient, &params).unwrap();
        assert_eq!(identifier.element(tags::QUERY_RETRIEVE_LEVEL).unwrap().to_str().unwrap(), "PATIENT");
        assert_eq!(identifier.element(tags::PATIENT_ID).unwrap().to_str().unwrap(), "12345");
    }
}

//! Adapts [`ServerContext`] to the DIMSE SCP's [`AssociationHandler`]
//! trait: translates wire-level DICOM operations into context calls and
//! maps [`CoreError`] back onto [`DimseError`].

use std::sync::Arc;

use async_trait::async_trait;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use dimse::scp::{AssociationHandler, MoveReport};
use dimse::types::QueryLevel;
use dimse::{DimseError, Result as DimseResult};

use super::{query_level_to_resource_type, ServerContext};

pub struct DicomHandler {
    pub context: Arc<ServerContext>,
}

impl DicomHandler {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }
}

fn to_dimse_error(e: crate::error::CoreError) -> DimseError {
    DimseError::OperationFailed(e.to_string())
}

#[async_trait]
impl AssociationHandler for DicomHandler {
    async fn on_echo(&self, _calling_aet: &str) -> DimseResult<()> {
        Ok(())
    }

    async fn on_store(&self, calling_aet: &str, object: DefaultDicomObject) -> DimseResult<()> {
        self.context
            .store_instance(object, calling_aet)
            .await
            .map_err(to_dimse_error)?;
        Ok(())
    }

    async fn on_find(
        &self,
        _calling_aet: &str,
        level: QueryLevel,
        identifier: InMemDicomObject,
    ) -> DimseResult<Vec<InMemDicomObject>> {
        let resource_type = query_level_to_resource_type(level);
        self.context
            .find_matches(resource_type, &identifier)
            .await
            .map_err(to_dimse_error)
    }

    async fn on_move(
        &self,
        _calling_aet: &str,
        level: QueryLevel,
        destination_aet: &str,
        identifier: InMemDicomObject,
    ) -> DimseResult<MoveReport> {
        let resource_type = query_level_to_resource_type(level);
        self.context
            .move_to(resource_type, &identifier, destination_aet)
            .await
            .map_err(to_dimse_error)
    }
}

//! ZIP archive generation for `GET /{…}/{id}/archive`, walking a resource
//! subtree and streaming every instance's Part 10 attachment into a
//! `zip::ZipWriter`. Switches to ZIP64 once the subtree is large enough
//! that plain ZIP offsets could overflow.

use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::ZipWriter;

use crate::context::ServerContext;
use crate::error::Result;
use crate::index::ResourceType;

const ZIP64_SIZE_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;
const ZIP64_ENTRY_THRESHOLD: usize = 65_535;

pub async fn build_archive(context: &ServerContext, public_id: &str) -> Result<Vec<u8>> {
    let instances = collect_instances(context, public_id).await?;

    let mut total_size: u64 = 0;
    let mut blobs = Vec::with_capacity(instances.len());
    for (index, instance_id) in instances.iter().enumerate() {
        let bytes = context
            .read_attachment(instance_id, crate::index::ContentType::Dicom)
            .await?;
        total_size += bytes.len() as u64;
        blobs.push((format!("{index}.dcm"), bytes));
    }

    let large_file = total_size >= ZIP64_SIZE_THRESHOLD || blobs.len() >= ZIP64_ENTRY_THRESHOLD;
    let options = FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(large_file);

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut cursor);
        for (name, bytes) in &blobs {
            writer
                .start_file(name, options)
                .map_err(|e| crate::error::CoreError::Internal(e.to_string()))?;
            writer
                .write_all(bytes)
                .map_err(|e| crate::error::CoreError::Internal(e.to_string()))?;
        }
        writer
            .finish()
            .map_err(|e| crate::error::CoreError::Internal(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

async fn collect_instances(context: &ServerContext, public_id: &str) -> Result<Vec<String>> {
    let record = context
        .index
        .get_resource_by_public_id(public_id)
        .await?
        .ok_or(crate::error::CoreError::UnknownResource)?;

    let mut out = Vec::new();
    let mut frontier = vec![record.id];
    while let Some(id) = frontier.pop() {
        let Some(current) = context.index.get_resource(id).await? else {
            continue;
        };
        if current.resource_type == ResourceType::Instance {
            out.push(current.public_id);
            continue;
        }
        frontier.extend(context.index.get_children(id).await?);
    }
    Ok(out)
}

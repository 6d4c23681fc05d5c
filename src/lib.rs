pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod globals;
pub mod hash;
pub mod http;
pub mod index;
pub mod modify;
pub mod storage;

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, prelude::*};

use crate::config::Config;
use crate::context::dicom_handler::DicomHandler;
use crate::context::ServerContext;
use crate::index::MetadataIndex;
use crate::storage::{CompressionKind, FilesystemContentStore};

pub async fn run(config: Config) {
    let config = Arc::new(config);
    crate::globals::set_config(config.clone());

    if config.logging.log_to_file {
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::fs::File::create(&config.logging.log_file_path).unwrap());

        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
            .expect("Failed to initialise logging");
    } else {
        tracing_subscriber::fmt()
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    tracing::info!("starting orthanc_core (AET: {})", config.dicom_aet);

    let compression = if config.storage_compression {
        CompressionKind::Zlib
    } else {
        CompressionKind::None
    };
    let content_store = Arc::new(
        FilesystemContentStore::new(&config.storage_directory, compression)
            .expect("failed to open content store"),
    );
    let index = MetadataIndex::open(Path::new(&config.index_directory).join("index.db").as_path())
        .expect("failed to open metadata index");

    let context = Arc::new(ServerContext::new(config.clone(), index, content_store));
    crate::globals::set_context(context.clone());

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    if config.dicom_server_enabled {
        let known_aets = config.dicom_modalities.values().map(|m| m.aet.clone()).collect();
        let dimse_config = dimse::config::DimseConfig {
            local_aet: config.dicom_aet.clone(),
            port: config.dicom_port,
            called_aet_check: config.dicom_check_called_aet,
            strict_aet_comparison: config.strict_aet_comparison,
            known_aets,
            ..Default::default()
        };
        let handler = Arc::new(DicomHandler::new(context.clone()));
        let scp = dimse::scp::DimseScp::new(dimse_config, handler);
        handles.push(tokio::spawn(async move {
            if let Err(e) = scp.run().await {
                tracing::error!("DICOM SCP stopped: {}", e);
            }
        }));
        tracing::info!("DICOM SCP enabled on port {}", config.dicom_port);
    }

    if config.http_server_enabled {
        let http_config = config.clone();
        let http_context = context.clone();
        let http_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = crate::http::serve(&http_config, http_context, http_shutdown).await {
                tracing::error!("HTTP facade stopped: {}", e);
            }
        }));
        tracing::info!("HTTP facade enabled on port {}", config.http_port);
    }

    tracing::info!("all servers started, press Ctrl+C to shut down");
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c signal");

    tracing::info!("shutting down...");
    shutdown.cancel();
    for handle in handles {
        handle.abort();
    }

    tracing::info!("orthanc_core shut down");
}

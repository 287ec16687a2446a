//! Shared application state for the metering ingestion handler.

use metering::BatchWriter;

#[derive(Clone)]
pub struct AppState {
    pub batch_writer: BatchWriter,
}

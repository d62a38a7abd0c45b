use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::info;

use crate::api::InputError;
use crate::event::{Entry, Event};
use crate::prometheus::EVENTS_EMITTED_TOTAL;
use crate::sinks::EventSink;

/// Logs events instead of producing them, for local runs.
pub struct PrintSink {}

#[async_trait]
impl EventSink for PrintSink {
    async fn send(&self, event: Event) -> Result<(), InputError> {
        info!(tag = %event.tag, time = event.time, "single event: {:?}", event.record);
        counter!(EVENTS_EMITTED_TOTAL).increment(1);

        Ok(())
    }

    async fn send_batch(&self, tag: String, entries: Vec<Entry>) -> Result<(), InputError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events", tag = %tag);
        let _enter = span.enter();

        histogram!("http_input_batch_size").record(entries.len() as f64);
        counter!(EVENTS_EMITTED_TOTAL).increment(entries.len() as u64);
        for entry in entries {
            info!(time = entry.time, "event: {:?}", entry.record);
        }

        Ok(())
    }
}

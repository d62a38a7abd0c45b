use async_trait::async_trait;

use crate::api::InputError;
use crate::event::{Emission, Entry, Event};

pub mod kafka;
pub mod print;

/// Downstream engine receiving decoded events. A request results in exactly one
/// call, `send` for a single record and `send_batch` for an array.
#[async_trait]
pub trait EventSink {
    async fn send(&self, event: Event) -> Result<(), InputError>;
    async fn send_batch(&self, tag: String, entries: Vec<Entry>) -> Result<(), InputError>;
}

pub async fn emit(sink: &(dyn EventSink + Send + Sync), emission: Emission) -> Result<(), InputError> {
    match emission {
        Emission::One(event) => sink.send(event).await,
        Emission::Batch { tag, entries } => sink.send_batch(tag, entries).await,
    }
}

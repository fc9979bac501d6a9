use crate::config::Decoder;
use crate::error::{Error, Result};
use crate::message::{Message, RawRecord};
use tracing::info_span;

/// Decode a record into a message.
///
/// The decoder error is returned as the source of [`Error::Decode`] untouched;
/// whether it ends the claim or only the record is up to the caller. The
/// message span is tagged with `group` when there is one.
pub fn process<T>(record: RawRecord, decoder: &Decoder<T>, group: Option<&str>) -> Result<Message<T>> {
    let payload = record.payload.as_deref().unwrap_or_default();
    let value = decoder(payload).map_err(|source| Error::Decode {
        topic: record.topic.clone(),
        partition: record.partition,
        offset: record.offset,
        source,
    })?;

    let span = match group {
        Some(group) => info_span!(
            "kafka_consume",
            group,
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
        ),
        None => info_span!(
            "kafka_consume",
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
        ),
    };

    Ok(Message::new(record, value, span))
}

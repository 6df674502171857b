//! Object-created notifications in, exactly one committed result per object
//! key out.

mod notification;
mod object_store;
mod pipeline;
mod processor;

pub use notification::{decode_object_key, parse_notifications, ObjectCreatedNotification, OBJECT_CREATED};
pub use object_store::{LocalObjectStore, ObjectStore};
pub use pipeline::{ObjectTriggerConfig, ObjectTriggerPipeline, TriggerOutcome};
pub use processor::{ImageConfig, ImageMetadataProcessor, ObjectProcessor};

#[cfg(test)]
pub(crate) use processor::png_bytes;

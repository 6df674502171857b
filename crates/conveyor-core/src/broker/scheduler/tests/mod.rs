use super::*;
use crate::event::Event;
use crate::message::{ReceiptHandle, StoredMessage};
use crate::storage::RocksDbStorage;

mod common;
use common::*;

mod ack;
mod enqueue;
mod recovery;
mod stats;

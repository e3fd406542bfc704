//! Destinations the engine propagates changes to.
//!
//! A sink owns its client and turns a batch of documents into a
//! [`BatchOutcome`]. Rejected rows are reported in the outcome, not as an
//! error; an `Err` means the batch could not be submitted at all.

mod message;
mod search;

pub use message::{MessageProducer, MessageTopicSink, MockProducer};
pub use search::{MockSearchClient, SearchClient, SearchIndexSink};

use crate::dedup::identity_key;
use crate::dispatch::BatchOutcome;
use crate::document::SinkDocument;
use crate::error::SyncResult;

/// A change destination.
pub trait Sink: Send + Sync {
    /// Index or topic name; checkpoints are only valid for this value.
    fn destination_id(&self) -> &str;

    /// First component of dedup identity keys.
    fn dedup_namespace(&self) -> &str;

    /// Returns true if the sink cannot run without a dedup cache.
    fn requires_dedup(&self) -> bool {
        false
    }

    /// Brings the destination into a writable state.
    ///
    /// Runs when the engine is built and again on demand.
    fn prepare(&self) -> SyncResult<()>;

    /// Delivers one batch.
    fn dispatch(&self, documents: &[SinkDocument]) -> SyncResult<BatchOutcome>;

    /// Dedup identity key of a document.
    fn identity_key(&self, account: &str, container: &str, object: &str) -> String {
        identity_key(self.dedup_namespace(), account, container, object)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn destination_id(&self) -> &str {
        (**self).destination_id()
    }

    fn dedup_namespace(&self) -> &str {
        (**self).dedup_namespace()
    }

    fn requires_dedup(&self) -> bool {
        (**self).requires_dedup()
    }

    fn prepare(&self) -> SyncResult<()> {
        (**self).prepare()
    }

    fn dispatch(&self, documents: &[SinkDocument]) -> SyncResult<BatchOutcome> {
        (**self).dispatch(documents)
    }

    fn identity_key(&self, account: &str, container: &str, object: &str) -> String {
        (**self).identity_key(account, container, object)
    }
}

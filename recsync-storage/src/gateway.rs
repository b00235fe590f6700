//! Remote source contracts.
//!
//! [`Gateway`] is the read/write boundary a record store talks to; concrete
//! transports implement it outside this workspace. [`HeadSource`] answers the
//! staleness poller's version-marker query. [`ReadCache`] is the invalidation
//! surface the poller drives without performing a write.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use recsync_core::{
    BusinessKey, ClientToken, CollectionId, Params, QueryPayload, SyncResult, TransportError,
    WireMap,
};
use serde::{Deserialize, Serialize};

/// Raw records returned by a read.
pub type ReadResult = Vec<WireMap>;

/// Pending mutations submitted in one write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    /// Records to create, keyed by client token.
    pub create: BTreeMap<ClientToken, WireMap>,
    /// Business keys of records to delete.
    pub delete: Vec<BusinessKey>,
    /// Records to update, keyed by client token.
    pub update: BTreeMap<ClientToken, WireMap>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty() && self.update.is_empty()
    }
}

/// Server confirmation of a write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Confirmed field values of created records, keyed by client token.
    #[serde(default)]
    pub create: BTreeMap<ClientToken, WireMap>,
    /// Confirmed field values of updated records, keyed by client token.
    #[serde(default)]
    pub update: BTreeMap<ClientToken, WireMap>,
    /// Business keys the server actually removed.
    #[serde(default)]
    pub delete: Vec<BusinessKey>,
}

/// Read/write contract to a remote source.
///
/// Both operations either succeed as a whole or fail with a
/// [`TransportError`]; a failed write must not have partially applied.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn read(&self, query: &QueryPayload, params: &Params)
        -> Result<ReadResult, TransportError>;

    async fn write(&self, batch: &WriteBatch, params: &Params)
        -> Result<WriteResponse, TransportError>;
}

#[async_trait]
impl<G: Gateway + ?Sized> Gateway for Arc<G> {
    async fn read(
        &self,
        query: &QueryPayload,
        params: &Params,
    ) -> Result<ReadResult, TransportError> {
        (**self).read(query, params).await
    }

    async fn write(
        &self,
        batch: &WriteBatch,
        params: &Params,
    ) -> Result<WriteResponse, TransportError> {
        (**self).write(batch, params).await
    }
}

/// Per-collection version marker query.
#[async_trait]
pub trait HeadSource: Send + Sync {
    /// Current marker of every requested collection. Collections the source
    /// does not know are simply absent from the result.
    async fn heads(
        &self,
        collections: &[CollectionId],
    ) -> Result<BTreeMap<CollectionId, i64>, TransportError>;
}

#[async_trait]
impl<H: HeadSource + ?Sized> HeadSource for Arc<H> {
    async fn heads(
        &self,
        collections: &[CollectionId],
    ) -> Result<BTreeMap<CollectionId, i64>, TransportError> {
        (**self).heads(collections).await
    }
}

/// A cache whose read entries can be wiped on demand.
#[async_trait]
pub trait ReadCache: Send + Sync {
    /// Remove every read-classified entry. Returns how many were removed.
    async fn clear_read_cache(&self) -> SyncResult<u64>;
}

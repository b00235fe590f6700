//! recsync Test Utilities
//!
//! Centralized test infrastructure for the recsync workspace:
//! - Mock gateway and head source with scripted responses
//! - A fixture record model
//! - Proptest generators for field maps
//! - Custom assertions

pub use recsync_core::{
    field_map, BusinessKey, ClientToken, FieldMap, FieldSchema, FieldSpec, FieldType, FieldValue,
    Params, QueryPayload, Record, RecordModel, SyncError, SyncResult, TransportError, WireMap,
};
pub use recsync_storage::{Gateway, HeadSource, ReadResult, WriteBatch, WriteResponse};

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

// ============================================================================
// MOCK GATEWAY
// ============================================================================

#[derive(Default)]
struct GatewayState {
    rows: ReadResult,
    read_failures: VecDeque<TransportError>,
    write_failures: VecDeque<TransportError>,
    write_responses: VecDeque<WriteResponse>,
    queries: Vec<QueryPayload>,
    read_params: Vec<Params>,
    batches: Vec<WriteBatch>,
    write_params: Vec<Params>,
    next_id: i64,
    hold_writes: bool,
}

/// Scriptable in-memory [`Gateway`].
///
/// Reads return the configured rows. Writes are recorded and, unless a
/// response was queued, echoed back: creates gain an `id` from an
/// auto-increment counter, updates return their submitted data, and every
/// delete is confirmed.
pub struct MockGateway {
    state: Mutex<GatewayState>,
    write_started: Notify,
    write_release: Notify,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GatewayState {
                next_id: 1,
                ..Default::default()
            }),
            write_started: Notify::new(),
            write_release: Notify::new(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GatewayState> {
        // A panicking test thread must not hide the mock's state from others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rows returned by every subsequent read.
    pub fn set_rows(&self, rows: ReadResult) {
        self.state().rows = rows;
    }

    /// First id handed out to echoed creates.
    pub fn set_next_id(&self, id: i64) {
        self.state().next_id = id;
    }

    pub fn fail_next_read(&self, error: TransportError) {
        self.state().read_failures.push_back(error);
    }

    pub fn fail_next_write(&self, error: TransportError) {
        self.state().write_failures.push_back(error);
    }

    /// Answer the next write with `response` instead of the echo.
    pub fn push_write_response(&self, response: WriteResponse) {
        self.state().write_responses.push_back(response);
    }

    /// Make writes wait for [`release_write`](Self::release_write).
    pub fn hold_writes(&self) {
        self.state().hold_writes = true;
    }

    /// Let one held write complete.
    pub fn release_write(&self) {
        self.write_release.notify_one();
    }

    /// Resolves once a write has reached the gateway.
    pub async fn write_started(&self) {
        self.write_started.notified().await;
    }

    pub fn read_calls(&self) -> usize {
        self.state().queries.len()
    }

    pub fn write_calls(&self) -> usize {
        self.state().batches.len()
    }

    pub fn last_query(&self) -> Option<QueryPayload> {
        self.state().queries.last().cloned()
    }

    pub fn last_read_params(&self) -> Option<Params> {
        self.state().read_params.last().cloned()
    }

    pub fn last_batch(&self) -> Option<WriteBatch> {
        self.state().batches.last().cloned()
    }

    pub fn last_write_params(&self) -> Option<Params> {
        self.state().write_params.last().cloned()
    }

    fn echo(state: &mut GatewayState, batch: &WriteBatch) -> WriteResponse {
        let mut response = WriteResponse::default();
        for (token, data) in &batch.create {
            let mut confirmed = data.clone();
            confirmed.insert("id".to_string(), json!(state.next_id));
            state.next_id += 1;
            response.create.insert(*token, confirmed);
        }
        for (token, data) in &batch.update {
            response.update.insert(*token, data.clone());
        }
        response.delete = batch.delete.clone();
        response
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn read(
        &self,
        query: &QueryPayload,
        params: &Params,
    ) -> Result<ReadResult, TransportError> {
        let mut state = self.state();
        state.queries.push(query.clone());
        state.read_params.push(params.clone());
        if let Some(error) = state.read_failures.pop_front() {
            return Err(error);
        }
        Ok(state.rows.clone())
    }

    async fn write(
        &self,
        batch: &WriteBatch,
        params: &Params,
    ) -> Result<WriteResponse, TransportError> {
        let hold = {
            let mut state = self.state();
            state.batches.push(batch.clone());
            state.write_params.push(params.clone());
            state.hold_writes
        };

        self.write_started.notify_one();
        if hold {
            self.write_release.notified().await;
        }

        let mut state = self.state();
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }
        match state.write_responses.pop_front() {
            Some(response) => Ok(response),
            None => Ok(Self::echo(&mut state, batch)),
        }
    }
}

// ============================================================================
// MOCK HEAD SOURCE
// ============================================================================

#[derive(Default)]
struct HeadState {
    heads: BTreeMap<String, i64>,
    failures: VecDeque<TransportError>,
    requests: Vec<Vec<String>>,
}

/// In-memory [`HeadSource`] returning settable markers.
#[derive(Default)]
pub struct MockHeadSource {
    state: Mutex<HeadState>,
}

impl MockHeadSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HeadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_head(&self, collection: &str, marker: i64) {
        self.state().heads.insert(collection.to_string(), marker);
    }

    pub fn fail_next(&self, error: TransportError) {
        self.state().failures.push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.state().requests.len()
    }

    pub fn last_request(&self) -> Option<Vec<String>> {
        self.state().requests.last().cloned()
    }
}

#[async_trait]
impl HeadSource for MockHeadSource {
    async fn heads(
        &self,
        collections: &[String],
    ) -> Result<BTreeMap<String, i64>, TransportError> {
        let mut state = self.state();
        state.requests.push(collections.to_vec());
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        Ok(collections
            .iter()
            .filter_map(|id| state.heads.get(id).map(|marker| (id.clone(), *marker)))
            .collect())
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Fixture model and helpers.

    use super::*;

    /// Contact records: `id` (integer key), `name`, `born` (timestamp) and
    /// `active` (boolean, defaults to true).
    pub struct ContactModel {
        schema: FieldSchema,
    }

    impl Default for ContactModel {
        fn default() -> Self {
            Self {
                schema: FieldSchema::new()
                    .field(FieldSpec::new("id", FieldType::Integer))
                    .field(FieldSpec::new("name", FieldType::Text))
                    .field(FieldSpec::new("born", FieldType::Timestamp))
                    .field(FieldSpec::new("active", FieldType::Boolean)),
            }
        }
    }

    impl RecordModel for ContactModel {
        fn id_key(&self) -> &str {
            "id"
        }

        fn schema(&self) -> &FieldSchema {
            &self.schema
        }

        fn init(&self) -> FieldMap {
            field_map([("active", true)])
        }
    }

    pub fn contact_model() -> Arc<ContactModel> {
        Arc::new(ContactModel::default())
    }

    /// A new local contact, not yet known to the server.
    pub fn new_contact(name: &str) -> Record {
        ContactModel::default().create(field_map([("name", name)]), true)
    }

    /// Wire row of a stored contact.
    pub fn contact_row(id: i64, name: &str) -> WireMap {
        let mut row = WireMap::new();
        row.insert("id".to_string(), json!(id));
        row.insert("name".to_string(), json!(name));
        row.insert("active".to_string(), json!(true));
        row
    }

    pub fn transport_error() -> TransportError {
        TransportError::RequestFailed {
            endpoint: "/contacts".to_string(),
            reason: "connection reset".to_string(),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for record data.

    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;

    /// A contact name.
    pub fn arb_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,10}"
    }

    /// A UTC timestamp with millisecond precision, between 1970 and 2100.
    pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        (0i64..4_102_444_800_000)
            .prop_filter_map("representable", DateTime::<Utc>::from_timestamp_millis)
    }

    /// Field data of a local contact.
    pub fn arb_contact_data() -> impl Strategy<Value = FieldMap> {
        (arb_name(), any::<bool>(), arb_timestamp()).prop_map(|(name, active, born)| {
            let mut data = FieldMap::new();
            data.insert("name".to_string(), FieldValue::Text(name));
            data.insert("active".to_string(), FieldValue::Bool(active));
            data.insert("born".to_string(), FieldValue::Timestamp(born));
            data
        })
    }

    /// Between `1` and `max` contact field maps.
    pub fn arb_contact_batch(max: usize) -> impl Strategy<Value = Vec<FieldMap>> {
        prop::collection::vec(arb_contact_data(), 1..=max)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for record state.

    use super::*;

    /// Assert a record has been confirmed and carries no pending edits.
    pub fn assert_committed(record: &Record) {
        assert!(!record.is_ghost(), "record {} is still a ghost", record.token());
        assert!(
            !record.is_modified(),
            "record {} is still modified",
            record.token()
        );
    }

    pub fn assert_transport_error<T: std::fmt::Debug>(result: &SyncResult<T>) {
        assert!(
            matches!(result, Err(SyncError::Transport(_))),
            "expected transport error, got {:?}",
            result
        );
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn test_mock_gateway_echoes_creates_with_ids() {
        let gateway = MockGateway::new();
        let record = new_contact("A");
        let mut batch = WriteBatch::default();
        let mut data = WireMap::new();
        data.insert("name".to_string(), json!("A"));
        batch.create.insert(record.token(), data);

        let response = gateway.write(&batch, &Params::new()).await.unwrap();
        assert_eq!(response.create[&record.token()]["id"], json!(1));
        assert_eq!(gateway.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_head_source_returns_known_collections() {
        let heads = MockHeadSource::new();
        heads.set_head("orders", 3);
        let result = heads
            .heads(&["orders".to_string(), "unknown".to_string()])
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result["orders"], 3);
    }

    #[test]
    fn test_new_contact_has_defaults() {
        let record = new_contact("A");
        assert!(record.is_ghost());
        assert_eq!(record.get("active"), Some(FieldValue::Bool(true)));
    }
}

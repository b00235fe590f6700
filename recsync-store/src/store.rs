//! Record store: a paged working set with optimistic local mutations.
//!
//! The store owns every record it tracks in a token-keyed arena. The visible
//! page is an ordered list of tokens into that arena, and the pending sets
//! are derived from it:
//!
//! - `created`: tokens of records inserted locally and not yet acknowledged.
//! - `removed`: records marked for deletion, already gone from the page.
//! - modified: every tracked, non-ghost, modified record outside `created`.
//!
//! Pending edits stay tracked across loads even when the new page does not
//! show them, so paging never drops an unsaved change.
//!
//! # Saving
//!
//! `save()` runs one write at a time per store. The batch is built from a
//! snapshot of the pending sets together with each record's revision. When
//! the response arrives, a record whose revision moved while the write was
//! in flight takes the server values but keeps its newer local values and
//! stays modified.
//!
//! # Locking
//!
//! The working set sits behind a std `RwLock` that is never held across an
//! await. Events are emitted after the lock is released.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use recsync_core::{
    merge_params, BusinessKey, ClientToken, FieldMap, Filter, Params, QueryPayload,
    ReconciliationError, Record, RecordFlags, RecordModel, Sort, StorageError, SyncConfig,
    SyncError, SyncResult, Transform, WireMap,
};
use recsync_storage::{
    DurableState, Gateway, WriteBatch, WriteResponse, SNAPSHOT_CREATE, SNAPSHOT_CREATE_FLAGS,
    SNAPSHOT_DELETE, SNAPSHOT_DELETE_FLAGS, SNAPSHOT_KEYS, SNAPSHOT_UPDATE, SNAPSHOT_UPDATE_FLAGS,
};
use tokio::sync::Mutex as AsyncMutex;

use crate::events::{EventBus, ListenerId, SaveHandle, SaveSummary, StoreEvent, StoreEventKind};

/// Decides where locally created records appear on a freshly loaded page.
///
/// Called with the page number and the number of loaded records; `None`
/// hides created records on that page.
pub type PlacementFn = dyn Fn(u32, usize) -> Option<usize> + Send + Sync;

/// Show created records at the top of the first page only.
pub fn first_page_placement(page: u32, _len: usize) -> Option<usize> {
    (page == 1).then_some(0)
}

/// Options of a single load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOptions {
    /// Page number, 1-based. Defaults to the store's current page.
    pub page: Option<u32>,
    /// Page size. Defaults to the store's current limit.
    pub limit: Option<u32>,
    /// Extra parameters merged over the store's base parameters.
    pub params: Params,
}

impl LoadOptions {
    pub fn page(page: u32) -> Self {
        Self {
            page: Some(page),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

#[derive(Debug)]
struct WorkingSet {
    tracked: BTreeMap<ClientToken, Record>,
    records: Vec<ClientToken>,
    created: Vec<ClientToken>,
    removed: Vec<Record>,
    /// Create tokens submitted by the save currently in flight.
    in_flight: BTreeSet<ClientToken>,
    page: u32,
    limit: u32,
    filters: Vec<Filter>,
    sort: Vec<Sort>,
    base_params: Params,
    last_options: Option<LoadOptions>,
    is_loading: bool,
    loaded: bool,
}

impl WorkingSet {
    fn new(limit: u32) -> Self {
        Self {
            tracked: BTreeMap::new(),
            records: Vec::new(),
            created: Vec::new(),
            removed: Vec::new(),
            in_flight: BTreeSet::new(),
            page: 1,
            limit,
            filters: Vec::new(),
            sort: Vec::new(),
            base_params: Params::new(),
            last_options: None,
            is_loading: false,
            loaded: false,
        }
    }

    fn is_created(&self, token: &ClientToken) -> bool {
        self.created.contains(token)
    }

    fn modified(&self) -> impl Iterator<Item = &Record> {
        self.tracked
            .values()
            .filter(move |r| !r.is_ghost() && r.is_modified() && !self.is_created(&r.token()))
    }

    fn visible(&self) -> Vec<Record> {
        self.records
            .iter()
            .filter_map(|token| self.tracked.get(token).cloned())
            .collect()
    }

    fn is_dirty(&self) -> bool {
        !self.created.is_empty() || !self.removed.is_empty() || self.modified().next().is_some()
    }

    /// Forget a record removed while its create was in flight, if the server
    /// never gave it a key. Returns whether one was dropped.
    fn cancel_unsent(&mut self, token: &ClientToken, model: &dyn RecordModel) -> bool {
        let before = self.removed.len();
        self.removed
            .retain(|r| r.token() != *token || model.business_key(r.fields()).is_some());
        self.removed.len() != before
    }
}

struct SavePlan {
    batch: WriteBatch,
    revisions: HashMap<ClientToken, u64>,
    params: Params,
}

/// Paged working set of records with pending-mutation tracking.
pub struct RecordStore<G: Gateway> {
    model: Arc<dyn RecordModel>,
    gateway: G,
    transform: Transform,
    state: RwLock<WorkingSet>,
    durable: Option<Arc<dyn DurableState>>,
    save_lock: AsyncMutex<()>,
    events: EventBus,
    placement: Arc<PlacementFn>,
}

impl<G: Gateway> RecordStore<G> {
    /// Create a store with default configuration and no durable state.
    pub fn new(model: Arc<dyn RecordModel>, gateway: G) -> Self {
        Self::with_config(model, gateway, &SyncConfig::default())
    }

    pub fn with_config(model: Arc<dyn RecordModel>, gateway: G, config: &SyncConfig) -> Self {
        Self {
            model,
            gateway,
            transform: Transform::default(),
            state: RwLock::new(WorkingSet::new(config.page_size)),
            durable: None,
            save_lock: AsyncMutex::new(()),
            events: EventBus::new(),
            placement: Arc::new(first_page_placement),
        }
    }

    /// Replace the field transform table.
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Replace the placement policy for created records.
    pub fn with_placement(
        mut self,
        placement: impl Fn(u32, usize) -> Option<usize> + Send + Sync + 'static,
    ) -> Self {
        self.placement = Arc::new(placement);
        self
    }

    /// Attach durable state and rehydrate pending mutations from it.
    ///
    /// Records come back with the flags they were persisted with. Snapshots
    /// written without flags restore `create` entries as ghosts, `update`
    /// entries as confirmed modified records and `delete` entries as
    /// confirmed records.
    pub fn with_durable_state(mut self, durable: Arc<dyn DurableState>) -> SyncResult<Self> {
        let created = self.restore(
            durable.as_ref(),
            (SNAPSHOT_CREATE, SNAPSHOT_CREATE_FLAGS),
            RecordFlags { ghost: true, modified: false },
        )?;
        let updated = self.restore(
            durable.as_ref(),
            (SNAPSHOT_UPDATE, SNAPSHOT_UPDATE_FLAGS),
            RecordFlags { ghost: false, modified: true },
        )?;
        let removed = self.restore(
            durable.as_ref(),
            (SNAPSHOT_DELETE, SNAPSHOT_DELETE_FLAGS),
            RecordFlags { ghost: false, modified: false },
        )?;

        {
            let state = self.state.get_mut().map_err(|_| StorageError::LockPoisoned)?;
            for record in created {
                state.created.push(record.token());
                state.tracked.insert(record.token(), record);
            }
            for record in updated {
                state.tracked.insert(record.token(), record);
            }
            state.removed.extend(removed);
            tracing::debug!(
                created = state.created.len(),
                tracked = state.tracked.len(),
                removed = state.removed.len(),
                "Rehydrated pending state"
            );
        }

        self.durable = Some(durable);
        Ok(self)
    }

    fn restore(
        &self,
        durable: &dyn DurableState,
        (key, flags_key): (&str, &str),
        fallback: RecordFlags,
    ) -> SyncResult<Vec<Record>> {
        let entries = durable.get(key)?.unwrap_or_default();
        let flags = match durable.get(flags_key)? {
            Some(flags) if flags.len() == entries.len() => flags
                .into_iter()
                .map(|raw| {
                    serde_json::from_value::<RecordFlags>(serde_json::Value::Object(raw)).map_err(
                        |e| StorageError::Serialization {
                            key: flags_key.to_string(),
                            reason: e.to_string(),
                        },
                    )
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                tracing::warn!(key = flags_key, "Snapshot flags out of step, using defaults");
                vec![fallback; entries.len()]
            }
            None => vec![fallback; entries.len()],
        };

        entries
            .iter()
            .zip(flags)
            .map(|(raw, flags)| -> SyncResult<Record> {
                let data = self.transform.decode(raw, self.model.schema())?;
                Ok(Record::restore(data, flags))
            })
            .collect()
    }

    fn read(&self) -> SyncResult<RwLockReadGuard<'_, WorkingSet>> {
        self.state
            .read()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))
    }

    fn write(&self) -> SyncResult<RwLockWriteGuard<'_, WorkingSet>> {
        self.state
            .write()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))
    }

    fn encode(&self, record: &Record) -> SyncResult<WireMap> {
        Ok(self.transform.encode(record.fields(), self.model.schema())?)
    }

    /// Mirror the pending sets into durable state.
    fn persist(&self, state: &WorkingSet) -> SyncResult<()> {
        let Some(durable) = &self.durable else {
            return Ok(());
        };

        let created: Vec<&Record> = state
            .created
            .iter()
            .filter_map(|token| state.tracked.get(token))
            .collect();
        let modified: Vec<&Record> = state.modified().collect();
        let removed: Vec<&Record> = state.removed.iter().collect();

        self.persist_section(durable.as_ref(), (SNAPSHOT_CREATE, SNAPSHOT_CREATE_FLAGS), &created)?;
        self.persist_section(durable.as_ref(), (SNAPSHOT_UPDATE, SNAPSHOT_UPDATE_FLAGS), &modified)?;
        self.persist_section(durable.as_ref(), (SNAPSHOT_DELETE, SNAPSHOT_DELETE_FLAGS), &removed)?;
        Ok(())
    }

    fn persist_section(
        &self,
        durable: &dyn DurableState,
        (key, flags_key): (&str, &str),
        records: &[&Record],
    ) -> SyncResult<()> {
        let data = records
            .iter()
            .map(|record| self.encode(record))
            .collect::<SyncResult<Vec<_>>>()?;
        let flags = records
            .iter()
            .map(|record| match serde_json::to_value(record.flags()) {
                Ok(serde_json::Value::Object(map)) => Ok(map),
                Ok(other) => Err(StorageError::Serialization {
                    key: flags_key.to_string(),
                    reason: format!("flags encoded as {}", other),
                }),
                Err(e) => Err(StorageError::Serialization {
                    key: flags_key.to_string(),
                    reason: e.to_string(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        durable.set(key, data)?;
        durable.set(flags_key, flags)?;
        Ok(())
    }

    /// Clear durable state when nothing is pending, rewrite it otherwise.
    fn settle(&self, state: &WorkingSet) -> SyncResult<()> {
        match &self.durable {
            Some(durable) if !state.is_dirty() => durable.remove_many(&SNAPSHOT_KEYS),
            Some(_) => self.persist(state),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribe to an event kind.
    pub fn on(
        &self,
        kind: StoreEventKind,
        listener: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.on(kind, listener)
    }

    pub fn off(&self, id: ListenerId) {
        self.events.off(id)
    }

    pub fn fire_data_change(&self) -> SyncResult<()> {
        let records = self.read()?.visible();
        self.events.emit(&StoreEvent::DataChange(records));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query state
    // ------------------------------------------------------------------

    pub fn set_filters(&self, filters: Vec<Filter>) -> SyncResult<()> {
        self.write()?.filters = filters;
        Ok(())
    }

    pub fn filters(&self) -> SyncResult<Vec<Filter>> {
        Ok(self.read()?.filters.clone())
    }

    pub fn set_sort(&self, sort: Vec<Sort>) -> SyncResult<()> {
        self.write()?.sort = sort;
        Ok(())
    }

    pub fn sort(&self) -> SyncResult<Vec<Sort>> {
        Ok(self.read()?.sort.clone())
    }

    /// Parameters sent with every read and write.
    pub fn set_base_params(&self, params: Params) -> SyncResult<()> {
        self.write()?.base_params = params;
        Ok(())
    }

    pub fn base_params(&self) -> SyncResult<Params> {
        Ok(self.read()?.base_params.clone())
    }

    pub fn page(&self) -> SyncResult<u32> {
        Ok(self.read()?.page)
    }

    pub fn limit(&self) -> SyncResult<u32> {
        Ok(self.read()?.limit)
    }

    pub fn is_loading(&self) -> bool {
        self.read().map(|s| s.is_loading).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Copies of the visible records, in order.
    pub fn records(&self) -> SyncResult<Vec<Record>> {
        Ok(self.read()?.visible())
    }

    /// Copy of a tracked record.
    pub fn get(&self, token: ClientToken) -> SyncResult<Option<Record>> {
        Ok(self.read()?.tracked.get(&token).cloned())
    }

    /// Records awaiting creation.
    pub fn created(&self) -> SyncResult<Vec<Record>> {
        let state = self.read()?;
        Ok(state
            .created
            .iter()
            .filter_map(|token| state.tracked.get(token).cloned())
            .collect())
    }

    /// Confirmed records with unsaved edits.
    pub fn modified(&self) -> SyncResult<Vec<Record>> {
        Ok(self.read()?.modified().cloned().collect())
    }

    /// Records awaiting deletion.
    pub fn removed(&self) -> SyncResult<Vec<Record>> {
        Ok(self.read()?.removed.clone())
    }

    /// Whether any mutation is waiting to be saved.
    pub fn is_dirty(&self) -> SyncResult<bool> {
        Ok(self.read()?.is_dirty())
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Insert records at `index` of the visible page and track them as
    /// creations. Tokens already tracked are ignored.
    pub fn insert(&self, index: usize, records: Vec<Record>) -> SyncResult<()> {
        let added = {
            let mut state = self.write()?;
            let mut at = index.min(state.records.len());
            let mut added = Vec::with_capacity(records.len());
            for record in records {
                let token = record.token();
                if state.tracked.contains_key(&token) {
                    continue;
                }
                state.records.insert(at, token);
                state.created.push(token);
                state.tracked.insert(token, record.clone());
                added.push(record);
                at += 1;
            }
            self.persist(&state)?;
            added
        };

        if !added.is_empty() {
            self.events.emit(&StoreEvent::Add(added));
        }
        Ok(())
    }

    /// Append records to the visible page.
    pub fn add(&self, records: Vec<Record>) -> SyncResult<()> {
        let len = self.read()?.records.len();
        self.insert(len, records)
    }

    /// Remove records from the page and mark them for deletion.
    ///
    /// Removing a record that was never created remotely cancels its
    /// creation instead. Unknown tokens are ignored.
    pub fn remove(&self, tokens: &[ClientToken]) -> SyncResult<()> {
        let gone = {
            let mut state = self.write()?;
            let mut gone = Vec::new();
            for token in tokens {
                let Some(record) = state.tracked.remove(token) else {
                    continue;
                };
                state.records.retain(|t| t != token);
                state.created.retain(|t| t != token);

                if !record.is_ghost() || state.in_flight.contains(token) {
                    // A ghost whose create is in flight is deleted once acknowledged.
                    state.removed.push(record.clone());
                }
                gone.push(record);
            }
            self.persist(&state)?;
            gone
        };

        if !gone.is_empty() {
            self.events.emit(&StoreEvent::Remove(gone));
        }
        Ok(())
    }

    /// Merge `partial` into a tracked record. Returns false for unknown tokens.
    pub fn update(&self, token: ClientToken, partial: FieldMap) -> SyncResult<bool> {
        let mut state = self.write()?;
        let Some(record) = state.tracked.get_mut(&token) else {
            return Ok(false);
        };
        record.set_data(partial);
        self.persist(&state)?;
        Ok(true)
    }

    /// Set one field of a tracked record. Returns false for unknown tokens.
    pub fn set_field(
        &self,
        token: ClientToken,
        key: impl Into<String>,
        value: impl Into<recsync_core::FieldValue>,
    ) -> SyncResult<bool> {
        let mut state = self.write()?;
        let Some(record) = state.tracked.get_mut(&token) else {
            return Ok(false);
        };
        record.set(key, value);
        self.persist(&state)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Read one page and merge it with the pending mutations.
    ///
    /// A failed read or an undecodable row leaves the current records and
    /// the query state (page, limit, options replayed by reload) untouched.
    pub async fn load(&self, options: LoadOptions) -> SyncResult<Vec<Record>> {
        let (query, params) = {
            let mut state = self.write()?;
            state.is_loading = true;
            let page = options.page.map_or(state.page, |p| p.max(1));
            let limit = options.limit.unwrap_or(state.limit);

            let mut query = QueryPayload::new(page, limit);
            query.filters = state.filters.clone();
            query.sort = state.sort.clone();
            query.params = merge_params(&state.base_params, &options.params);
            (query, state.base_params.clone())
        };

        tracing::debug!(page = query.page, limit = query.limit, "Loading records");

        let rows = match self.gateway.read(&query, &params).await {
            Ok(rows) => rows,
            Err(e) => return self.fail_load(SyncError::from(e), query.page),
        };

        match self.apply_rows(&rows, Some(query.page)) {
            Ok(records) => {
                let mut state = self.write()?;
                state.is_loading = false;
                state.limit = query.limit;
                state.last_options = Some(options);
                state.loaded = true;
                Ok(records)
            }
            Err(e) => self.fail_load(e, query.page),
        }
    }

    fn fail_load(&self, error: SyncError, page: u32) -> SyncResult<Vec<Record>> {
        tracing::warn!(error = %error, page, "Load failed");
        self.write()?.is_loading = false;
        Err(error)
    }

    /// Replace the visible page with `rows`.
    ///
    /// Rows whose business key is pending deletion are dropped. Rows matching
    /// a record with unsaved edits are replaced by that record. Created
    /// records are placed according to the placement policy.
    pub fn load_data(&self, rows: &[WireMap]) -> SyncResult<Vec<Record>> {
        self.apply_rows(rows, None)
    }

    /// Decode `rows` and make them the visible page, moving to `page` first
    /// when given. Nothing changes if a row fails to decode.
    fn apply_rows(&self, rows: &[WireMap], page: Option<u32>) -> SyncResult<Vec<Record>> {
        let decoded = rows
            .iter()
            .map(|raw| self.transform.decode(raw, self.model.schema()))
            .collect::<Result<Vec<_>, _>>()?;

        let records = {
            let mut state = self.write()?;
            if let Some(page) = page {
                state.page = page;
            }

            let deleting: HashSet<BusinessKey> = state
                .removed
                .iter()
                .filter_map(|r| self.model.business_key(r.fields()))
                .collect();
            let edited: HashMap<BusinessKey, ClientToken> = state
                .modified()
                .filter_map(|r| self.model.business_key(r.fields()).map(|k| (k, r.token())))
                .collect();

            // Keep everything with a pending mutation; drop the old page.
            let pending: BTreeSet<ClientToken> = state
                .created
                .iter()
                .copied()
                .chain(state.modified().map(Record::token))
                .collect();
            state.tracked.retain(|token, _| pending.contains(token));

            let mut page = Vec::with_capacity(decoded.len());
            for data in decoded {
                let key = self.model.business_key(&data);
                if let Some(key) = &key {
                    if deleting.contains(key) {
                        continue;
                    }
                    if let Some(token) = edited.get(key) {
                        if !page.contains(token) {
                            page.push(*token);
                        }
                        continue;
                    }
                }
                let record = self.model.create(data, false);
                page.push(record.token());
                state.tracked.insert(record.token(), record);
            }

            if let Some(index) = (self.placement)(state.page, page.len()) {
                let at = index.min(page.len());
                for (offset, token) in state.created.iter().enumerate() {
                    page.insert(at + offset, *token);
                }
            }

            state.records = page;
            state.visible()
        };

        self.events.emit(&StoreEvent::DataChange(records.clone()));
        Ok(records)
    }

    /// Whether a previous load succeeded.
    pub fn can_reload(&self) -> bool {
        self.read()
            .map(|s| s.loaded && s.last_options.is_some())
            .unwrap_or(false)
    }

    /// Replay the last load. Returns `None` when no load has succeeded yet.
    pub async fn reload(&self) -> SyncResult<Option<Vec<Record>>> {
        let options = {
            let state = self.read()?;
            match (&state.last_options, state.loaded) {
                (Some(options), true) => options.clone(),
                _ => return Ok(None),
            }
        };
        self.load(options).await.map(Some)
    }

    // ------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------

    fn plan_save(&self) -> SyncResult<SavePlan> {
        let mut state = self.write()?;
        let mut batch = WriteBatch::default();
        let mut revisions = HashMap::new();

        for token in &state.created {
            if let Some(record) = state.tracked.get(token) {
                batch.create.insert(*token, self.encode(record)?);
                revisions.insert(*token, record.revision());
            }
        }
        for record in state.modified() {
            batch.update.insert(record.token(), self.encode(record)?);
            revisions.insert(record.token(), record.revision());
        }
        batch.delete = state
            .removed
            .iter()
            .filter_map(|r| self.model.business_key(r.fields()))
            .collect();

        state.in_flight = batch.create.keys().copied().collect();
        Ok(SavePlan {
            batch,
            revisions,
            params: state.base_params.clone(),
        })
    }

    /// Submit every pending mutation in one write and reconcile the response.
    ///
    /// Saves are serialized per store: a second call waits for the first to
    /// finish and then submits whatever is still pending. A store with
    /// nothing pending returns an empty summary without calling the gateway.
    pub async fn save(&self) -> SyncResult<SaveSummary> {
        let _guard = self.save_lock.lock().await;

        let plan = self.plan_save()?;
        if plan.batch.is_empty() {
            self.write()?.in_flight.clear();
            return Ok(SaveSummary::default());
        }

        let (resolver, handle) = SaveHandle::channel();
        self.events.emit(&StoreEvent::Save {
            request: plan.batch.clone(),
            handle,
        });

        tracing::debug!(
            create = plan.batch.create.len(),
            update = plan.batch.update.len(),
            delete = plan.batch.delete.len(),
            "Saving pending mutations"
        );

        let outcome = match self.gateway.write(&plan.batch, &plan.params).await {
            Ok(response) => self.reconcile(&plan, response),
            Err(e) => {
                tracing::warn!(error = %e, "Save failed, pending state kept");
                let mut state = self.write()?;
                let submitted: Vec<ClientToken> = state.in_flight.iter().copied().collect();
                for token in &submitted {
                    if state.cancel_unsent(token, self.model.as_ref()) {
                        tracing::debug!(%token, "Dropped removed record that was never created");
                    }
                }
                state.in_flight.clear();
                self.settle(&state)?;
                Err(SyncError::from(e))
            }
        };

        if outcome.is_ok() {
            self.fire_data_change()?;
        }
        resolver.resolve(&outcome);
        outcome
    }

    fn reconcile(&self, plan: &SavePlan, response: WriteResponse) -> SyncResult<SaveSummary> {
        let mut summary = SaveSummary::default();
        let mut guard = self.write()?;
        let state = &mut *guard;
        state.in_flight.clear();

        for token in plan.batch.create.keys() {
            let Some(raw) = response.create.get(token) else {
                let err = ReconciliationError::MissingCreate {
                    token: token.to_string(),
                };
                if state.cancel_unsent(token, self.model.as_ref()) {
                    summary.cancelled.push(*token);
                } else {
                    tracing::warn!(error = %err, "Create left pending");
                    summary.unreconciled.push(*token);
                }
                continue;
            };
            let server = match self.transform.decode(raw, self.model.schema()) {
                Ok(server) => server,
                Err(e) => {
                    tracing::warn!(%token, error = %e, "Undecodable create response");
                    if state.cancel_unsent(token, self.model.as_ref()) {
                        summary.cancelled.push(*token);
                    } else {
                        summary.unreconciled.push(*token);
                    }
                    continue;
                }
            };

            state.created.retain(|t| t != token);
            let submitted = plan.revisions.get(token).copied();
            if let Some(record) = state.tracked.get_mut(token) {
                acknowledge(record, server, submitted);
            } else if let Some(record) = state.removed.iter_mut().find(|r| r.token() == *token) {
                // Removed while in flight: now it has a key to delete by.
                record.acknowledge(server);
            }
            summary.created.push(*token);
        }

        for token in plan.batch.update.keys() {
            let Some(raw) = response.update.get(token) else {
                let err = ReconciliationError::MissingUpdate {
                    token: token.to_string(),
                };
                tracing::warn!(error = %err, "Update left pending");
                summary.unreconciled.push(*token);
                continue;
            };
            let server = match self.transform.decode(raw, self.model.schema()) {
                Ok(server) => server,
                Err(e) => {
                    tracing::warn!(%token, error = %e, "Undecodable update response");
                    summary.unreconciled.push(*token);
                    continue;
                }
            };

            let submitted = plan.revisions.get(token).copied();
            if let Some(record) = state.tracked.get_mut(token) {
                acknowledge(record, server, submitted);
                summary.updated.push(*token);
            }
        }

        let confirmed: HashSet<&BusinessKey> = response.delete.iter().collect();
        for key in &response.delete {
            if !plan.batch.delete.contains(key) {
                let err = ReconciliationError::UnknownKey {
                    key: key.to_string(),
                };
                tracing::warn!(error = %err, "Ignoring unrequested delete");
            }
        }
        state.removed.retain(|record| {
            match self.model.business_key(record.fields()) {
                Some(key) if plan.batch.delete.contains(&key) && confirmed.contains(&key) => {
                    summary.deleted.push(key);
                    false
                }
                _ => true,
            }
        });

        // Pages drop records that were never tracked, so prune anything no
        // longer pending and no longer visible.
        let visible: HashSet<ClientToken> = state.records.iter().copied().collect();
        let pending: HashSet<ClientToken> = state
            .created
            .iter()
            .copied()
            .chain(state.modified().map(Record::token))
            .collect();
        state
            .tracked
            .retain(|token, _| visible.contains(token) || pending.contains(token));

        self.settle(state)?;

        tracing::debug!(
            created = summary.created.len(),
            updated = summary.updated.len(),
            deleted = summary.deleted.len(),
            unreconciled = summary.unreconciled.len(),
            "Save reconciled"
        );
        Ok(summary)
    }
}

/// Apply server values to `record`. If it was edited after the batch was
/// built, its current local values are reapplied on top and it stays
/// modified.
fn acknowledge(record: &mut Record, server: FieldMap, submitted: Option<u64>) {
    if submitted == Some(record.revision()) {
        record.acknowledge(server);
    } else {
        let local = record.data();
        record.acknowledge(server);
        record.set_data(local);
    }
}

/// A store the staleness poller can refresh.
#[async_trait]
pub trait Reloadable: Send + Sync {
    fn can_reload(&self) -> bool;

    async fn reload(&self) -> SyncResult<()>;
}

#[async_trait]
impl<G: Gateway> Reloadable for RecordStore<G> {
    fn can_reload(&self) -> bool {
        RecordStore::can_reload(self)
    }

    async fn reload(&self) -> SyncResult<()> {
        RecordStore::reload(self).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsync_core::{field_map, FieldValue, TransportError};
    use recsync_storage::{InMemoryDurableState, ReadResult};
    use serde_json::json;
    use std::sync::Mutex;

    struct Contact {
        schema: recsync_core::FieldSchema,
    }

    impl RecordModel for Contact {
        fn id_key(&self) -> &str {
            "id"
        }

        fn schema(&self) -> &recsync_core::FieldSchema {
            &self.schema
        }
    }

    fn model() -> Arc<dyn RecordModel> {
        Arc::new(Contact {
            schema: recsync_core::FieldSchema::new(),
        })
    }

    #[derive(Default)]
    struct ScriptedGateway {
        rows: Mutex<ReadResult>,
        response: Mutex<Option<Result<WriteResponse, TransportError>>>,
        batches: Mutex<Vec<WriteBatch>>,
    }

    #[async_trait]
    impl Gateway for ScriptedGateway {
        async fn read(
            &self,
            _query: &QueryPayload,
            _params: &Params,
        ) -> Result<ReadResult, TransportError> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn write(
            &self,
            batch: &WriteBatch,
            _params: &Params,
        ) -> Result<WriteResponse, TransportError> {
            self.batches.lock().unwrap().push(batch.clone());
            self.response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(WriteResponse::default()))
        }
    }

    fn row(id: i64, name: &str) -> WireMap {
        let mut map = WireMap::new();
        map.insert("id".to_string(), json!(id));
        map.insert("name".to_string(), json!(name));
        map
    }

    #[test]
    fn test_first_page_placement() {
        assert_eq!(first_page_placement(1, 10), Some(0));
        assert_eq!(first_page_placement(2, 10), None);
    }

    #[test]
    fn test_insert_tracks_creation() {
        let store = RecordStore::new(model(), ScriptedGateway::default());
        let record = Record::new(field_map([("name", "A")]), true);
        let token = record.token();

        store.insert(0, vec![record]).unwrap();
        assert!(store.is_dirty().unwrap());
        assert_eq!(store.created().unwrap().len(), 1);
        assert_eq!(store.records().unwrap()[0].token(), token);
        assert!(store.modified().unwrap().is_empty());
    }

    #[test]
    fn test_remove_ghost_cancels_create() {
        let store = RecordStore::new(model(), ScriptedGateway::default());
        let record = Record::new(field_map([("name", "A")]), true);
        let token = record.token();
        store.add(vec![record]).unwrap();

        store.remove(&[token]).unwrap();
        assert!(store.created().unwrap().is_empty());
        assert!(store.removed().unwrap().is_empty());
        assert!(!store.is_dirty().unwrap());
    }

    #[test]
    fn test_load_data_substitutes_edited_records() {
        let store = RecordStore::new(model(), ScriptedGateway::default());
        store.load_data(&[row(1, "A"), row(2, "B")]).unwrap();
        let token = store.records().unwrap()[0].token();
        store.set_field(token, "name", "A2").unwrap();

        let records = store.load_data(&[row(1, "stale"), row(2, "B")]).unwrap();
        assert_eq!(records[0].token(), token);
        assert_eq!(records[0].get("name"), Some(FieldValue::from("A2")));
        assert!(records[0].is_modified());
    }

    #[test]
    fn test_edits_survive_paging() {
        let store = RecordStore::new(model(), ScriptedGateway::default());
        store.load_data(&[row(1, "A")]).unwrap();
        let token = store.records().unwrap()[0].token();
        store.update(token, field_map([("name", "A2")])).unwrap();

        store.load_data(&[row(2, "B")]).unwrap();
        assert_eq!(store.records().unwrap().len(), 1);
        assert_eq!(store.modified().unwrap().len(), 1);
        assert_eq!(
            store.get(token).unwrap().unwrap().get("name"),
            Some(FieldValue::from("A2"))
        );
    }

    #[test]
    fn test_update_unknown_token() {
        let store = RecordStore::new(model(), ScriptedGateway::default());
        assert!(!store.update(ClientToken::new(), FieldMap::new()).unwrap());
    }

    #[tokio::test]
    async fn test_empty_save_skips_gateway() {
        let store = RecordStore::new(model(), ScriptedGateway::default());
        let summary = store.save().await.unwrap();
        assert_eq!(summary, SaveSummary::default());
        assert!(store.gateway.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_create_stays_pending() {
        let gateway = ScriptedGateway::default();
        *gateway.response.lock().unwrap() = Some(Ok(WriteResponse::default()));
        let store = RecordStore::new(model(), gateway);
        let record = Record::new(field_map([("name", "A")]), true);
        let token = record.token();
        store.insert(0, vec![record]).unwrap();

        let summary = store.save().await.unwrap();
        assert_eq!(summary.unreconciled, vec![token]);
        assert!(store.get(token).unwrap().unwrap().is_ghost());
        assert_eq!(store.created().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_rewrites_snapshot() {
        let gateway = ScriptedGateway::default();
        *gateway.response.lock().unwrap() = Some(Err(TransportError::Unavailable {
            reason: "offline".to_string(),
        }));
        let durable = Arc::new(InMemoryDurableState::new());
        let store = RecordStore::new(model(), gateway)
            .with_durable_state(durable.clone())
            .unwrap();
        store
            .insert(0, vec![Record::new(field_map([("name", "A")]), true)])
            .unwrap();
        durable.remove_many(&SNAPSHOT_KEYS).unwrap();

        let err = store.save().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(durable.get(SNAPSHOT_CREATE).unwrap().map(|v| v.len()), Some(1));
        assert!(store.is_dirty().unwrap());
    }

    #[test]
    fn test_rehydrate_keeps_flags_of_edited_records() {
        let durable = Arc::new(InMemoryDurableState::new());
        let store = RecordStore::new(model(), ScriptedGateway::default())
            .with_durable_state(durable.clone())
            .unwrap();
        let record = Record::new(field_map([("name", "A")]), true);
        let token = record.token();
        store.add(vec![record]).unwrap();
        store.update(token, field_map([("name", "B")])).unwrap();

        store.load_data(&[row(1, "C")]).unwrap();
        let confirmed = store.records().unwrap()[1].token();
        store.set_field(confirmed, "name", "C2").unwrap();
        store.remove(&[confirmed]).unwrap();

        let restored = RecordStore::new(model(), ScriptedGateway::default())
            .with_durable_state(durable.clone())
            .unwrap();
        let created = restored.created().unwrap();
        assert_eq!(created[0].flags(), RecordFlags { ghost: true, modified: true });
        assert_eq!(created[0].get("name"), Some(FieldValue::from("B")));
        let removed = restored.removed().unwrap();
        assert_eq!(removed[0].flags(), store.removed().unwrap()[0].flags());
    }

    #[test]
    fn test_rehydrate_without_flags_uses_defaults() {
        let durable = Arc::new(InMemoryDurableState::new());
        durable.set(SNAPSHOT_CREATE, vec![row(0, "A")]).unwrap();
        durable.set(SNAPSHOT_UPDATE, vec![row(1, "B")]).unwrap();

        let store = RecordStore::new(model(), ScriptedGateway::default())
            .with_durable_state(durable)
            .unwrap();
        assert_eq!(
            store.created().unwrap()[0].flags(),
            RecordFlags { ghost: true, modified: false }
        );
        assert_eq!(
            store.modified().unwrap()[0].flags(),
            RecordFlags { ghost: false, modified: true }
        );
    }
}

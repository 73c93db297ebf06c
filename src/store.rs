//! Attestation store contract and an in-memory implementation
//!
//! The store is shared by all verification tasks of a batch. Each operation
//! is atomic on its own; in particular "is this node already tracked for the
//! batch" and "track it" happen in one critical section, so two tasks racing
//! on the same node never both believe they were first.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::attestation::{PrefetchParameters, ValidatedAttestation};
use crate::proto::Attestation;

#[async_trait]
pub trait AttestationStore: Send + Sync {
    /// Whether at least `client_cache_size` unexpired attestations fetched
    /// no earlier than `fetch_time` are tracked for `parameters`
    async fn attestations_exist(
        &self,
        parameters: &PrefetchParameters,
        client_cache_size: usize,
        fetch_time: DateTime<Utc>,
    ) -> bool;

    /// Forget everything tracked for one batch of a workload
    async fn delete_entries(&self, parameters: &PrefetchParameters, batch_id: u64);

    /// Whether an unexpired validated attestation exists for the node
    async fn node_exists(&self, unique_node_identifier: &str) -> bool;

    /// Associate a known node with a batch
    ///
    /// Returns `true` if the node was already tracked for this batch.
    async fn track_node_for_parameters(
        &self,
        parameters: &PrefetchParameters,
        unique_node_identifier: &str,
        prefetched: bool,
        batch_id: u64,
        fetch_time: DateTime<Utc>,
    ) -> bool;

    /// Store a validated attestation and track it for the batch
    async fn save_validated_attestation(
        &self,
        validated: &ValidatedAttestation,
        parameters: &PrefetchParameters,
        prefetched: bool,
        batch_id: u64,
        fetch_time: DateTime<Utc>,
    ) -> SaveOutcome;

    /// Every cached node, sorted by unique identifier
    async fn all_nodes_and_attestations(&self) -> Vec<(String, StoredAttestation)>;

    async fn delete_all_entries(&self);
}

/// Result of `AttestationStore::save_validated_attestation`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,

    /// Another task tracked the node for this batch first
    AlreadyTracked,

    /// The store refused the write for any other reason
    Rejected,
}

impl SaveOutcome {
    pub fn is_saved(self) -> bool {
        self == SaveOutcome::Saved
    }
}

/// A validated attestation as kept in the cache
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAttestation {
    pub attestation: Attestation,
    pub public_key: Vec<u8>,
    pub expiry: DateTime<Utc>,
    pub validated_cell_id: Option<String>,
}

#[derive(Debug)]
struct BatchEntry {
    fetch_time: DateTime<Utc>,
    nodes: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<String, StoredAttestation>,
    batches: HashMap<PrefetchParameters, BTreeMap<u64, BatchEntry>>,
}

impl State {
    fn batch_mut(
        &mut self,
        parameters: &PrefetchParameters,
        batch_id: u64,
        fetch_time: DateTime<Utc>,
    ) -> &mut BatchEntry {
        self.batches
            .entry(parameters.clone())
            .or_default()
            .entry(batch_id)
            .or_insert_with(|| BatchEntry {
                fetch_time,
                nodes: BTreeSet::new(),
            })
    }

    /// Drop node records no batch refers to any more
    fn prune_untracked(&mut self) {
        let tracked: HashSet<&String> = self
            .batches
            .values()
            .flat_map(|batches| batches.values())
            .flat_map(|batch| batch.nodes.iter())
            .collect();
        self.nodes.retain(|uid, _| tracked.contains(uid));
    }
}

/// Process-local attestation store
///
/// Prefetched and prewarmed attestations share one pool here, so the
/// `prefetched` flag is accepted but not recorded.
#[derive(Debug, Default)]
pub struct InMemoryAttestationStore {
    state: Mutex<State>,
}

impl InMemoryAttestationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes tracked for one batch of a workload
    pub fn tracked_count(&self, parameters: &PrefetchParameters, batch_id: u64) -> usize {
        self.state
            .lock()
            .batches
            .get(parameters)
            .and_then(|batches| batches.get(&batch_id))
            .map_or(0, |batch| batch.nodes.len())
    }
}

#[async_trait]
impl AttestationStore for InMemoryAttestationStore {
    async fn attestations_exist(
        &self,
        parameters: &PrefetchParameters,
        client_cache_size: usize,
        fetch_time: DateTime<Utc>,
    ) -> bool {
        let now = Utc::now();
        let state = self.state.lock();
        let Some(batches) = state.batches.get(parameters) else {
            return false;
        };

        let fresh: HashSet<&String> = batches
            .values()
            .filter(|batch| batch.fetch_time >= fetch_time)
            .flat_map(|batch| batch.nodes.iter())
            .filter(|uid| state.nodes.get(*uid).is_some_and(|node| node.expiry > now))
            .collect();

        fresh.len() >= client_cache_size
    }

    async fn delete_entries(&self, parameters: &PrefetchParameters, batch_id: u64) {
        let mut state = self.state.lock();
        if let Some(batches) = state.batches.get_mut(parameters) {
            batches.remove(&batch_id);
            if batches.is_empty() {
                state.batches.remove(parameters);
            }
        }
        state.prune_untracked();
    }

    async fn node_exists(&self, unique_node_identifier: &str) -> bool {
        let now = Utc::now();
        self.state
            .lock()
            .nodes
            .get(unique_node_identifier)
            .is_some_and(|node| node.expiry > now)
    }

    async fn track_node_for_parameters(
        &self,
        parameters: &PrefetchParameters,
        unique_node_identifier: &str,
        _prefetched: bool,
        batch_id: u64,
        fetch_time: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.lock();
        let batch = state.batch_mut(parameters, batch_id, fetch_time);
        !batch.nodes.insert(unique_node_identifier.to_string())
    }

    async fn save_validated_attestation(
        &self,
        validated: &ValidatedAttestation,
        parameters: &PrefetchParameters,
        _prefetched: bool,
        batch_id: u64,
        fetch_time: DateTime<Utc>,
    ) -> SaveOutcome {
        let Some(uid) = validated.unique_node_identifier.as_deref() else {
            return SaveOutcome::Rejected;
        };

        let mut state = self.state.lock();
        let batch = state.batch_mut(parameters, batch_id, fetch_time);
        if !batch.nodes.insert(uid.to_string()) {
            return SaveOutcome::AlreadyTracked;
        }

        state.nodes.insert(
            uid.to_string(),
            StoredAttestation {
                attestation: validated.attestation.clone(),
                public_key: validated.public_key.clone(),
                expiry: validated.expiry,
                validated_cell_id: validated.validated_cell_id.clone(),
            },
        );
        SaveOutcome::Saved
    }

    async fn all_nodes_and_attestations(&self) -> Vec<(String, StoredAttestation)> {
        let state = self.state.lock();
        let mut nodes: Vec<_> = state
            .nodes
            .iter()
            .map(|(uid, node)| (uid.clone(), node.clone()))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes
    }

    async fn delete_all_entries(&self) {
        let mut state = self.state.lock();
        state.nodes.clear();
        state.batches.clear();
    }
}

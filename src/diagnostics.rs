//! Inspection helpers for the attestation cache

use tracing::info;

use crate::store::AttestationStore;

/// Describe every cached node, one entry per node
pub async fn cache_report(store: &dyn AttestationStore) -> Vec<String> {
    store
        .all_nodes_and_attestations()
        .await
        .into_iter()
        .map(|(uid, node)| {
            format!(
                "{uid}\n    publicKey: {}\n    attestationExpiry: {}\n    cloudOSVersion: {}, cloudOSReleaseType: {}, unvalidatedCellID: {:?}\n    validatedCellID: {:?}\n    ensembleID: {:?}",
                hex::encode(&node.public_key),
                node.expiry.to_rfc3339(),
                node.attestation.cloudos_version,
                node.attestation.cloudos_release_type,
                node.attestation.unvalidated_cell_id,
                node.validated_cell_id,
                node.attestation.ensemble_id,
            )
        })
        .collect()
}

/// Drop every cached attestation and batch association
pub async fn reset_cache(store: &dyn AttestationStore) {
    store.delete_all_entries().await;
    info!("attestation cache reset");
}

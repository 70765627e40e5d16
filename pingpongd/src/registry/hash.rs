use sha2::{Sha256, Digest};
use shared::types::PeerEntry;

/// SHA-256 over the stable fields of a peer list.
/// Peers are sorted by identifier for deterministic output; confirmation time
/// and the response text are left out because they change on every re-confirm.
pub fn compute_hash(peers: &[&PeerEntry]) -> String {
    let mut indices: Vec<usize> = (0..peers.len()).collect();
    indices.sort_by(|&a, &b| peers[a].identifier.cmp(&peers[b].identifier));

    let mut hasher = Sha256::new();
    for &i in &indices {
        let peer = peers[i];
        update_field(&mut hasher, peer.identifier.as_bytes());
        for addr in &peer.addresses {
            update_field(&mut hasher, addr.to_string().as_bytes());
        }
        update_field(&mut hasher, &peer.port.to_be_bytes());
        update_field(&mut hasher, peer.payload.as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Length-prefix each field so adjacent fields cannot run together.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

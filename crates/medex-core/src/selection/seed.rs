/// Deterministic seed derivation for adaptive selection.
///
/// The seed is a pure function of the request (user, mode, count, sorted
/// filters), so two identical requests against an unchanged state store
/// replay the exact same sampling and shuffling decisions.
use rand::rngs::StdRng;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::SessionMode;

/// Derive the 64-bit selection seed and its hex form for logging.
pub fn derive_seed(
    user_id: Uuid,
    mode: SessionMode,
    count: usize,
    block_ids: &[i64],
    theme_ids: Option<&[i64]>,
) -> (u64, String) {
    let mut blocks: Vec<i64> = block_ids.to_vec();
    blocks.sort_unstable();
    let mut themes: Vec<i64> = theme_ids.map(|t| t.to_vec()).unwrap_or_default();
    themes.sort_unstable();

    let seed_string = format!(
        "{}:{}:{}:{}:{}",
        user_id,
        mode.as_str(),
        count,
        join(&blocks),
        join(&themes),
    );

    let digest = Sha256::digest(seed_string.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let seed = u64::from_be_bytes(bytes);
    (seed, hex_prefix(&digest))
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

fn join(values: &[i64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn hex_prefix(digest: &[u8]) -> String {
    digest
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

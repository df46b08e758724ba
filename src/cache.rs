//! Content-addressed job cache.
//!
//! A job's fingerprint is the SHA-256 of the canonical JSON of its
//! id-stripped spec, the workflow description and the digest map of every
//! file in its workspace. A hit means a byte-equivalent job already finished:
//! its archived outputs are copied back into the fresh workspace (hydration)
//! and no backend submission happens.
//!
//! Archives live under `<workspace>/archive/<fingerprint>/`. Writers take a
//! per-fingerprint advisory file lock and publish with a write-to-temp plus
//! atomic rename, so readers never observe a partial archive and a crash
//! leaves only an unreferenced temp directory for the next writer to sweep.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::db::JobStore;
use crate::errors::{JobError, Result};

/// Directory names under the workspace root that never participate in
/// fingerprints and are never archived: the archive itself and the
/// controller's submission staging area.
const EXCLUDED_TOP_LEVEL: &[&str] = &["archive", ".conductor"];

/// Compact JSON with object keys in sorted order.
///
/// `serde_json` maps are ordered, so re-serializing a parsed value is
/// already canonical; this helper exists to make that contract explicit at
/// call sites.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn walk_files(
    root: &Path,
    dir: &Path,
    top_level: bool,
    digests: &mut BTreeMap<String, String>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if top_level && EXCLUDED_TOP_LEVEL.iter().any(|n| name == *n) {
            continue;
        }
        if path.is_dir() {
            walk_files(root, &path, false, digests)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under the walk root")
                .to_string_lossy()
                .into_owned();
            digests.insert(rel, hash_file(&path)?);
        }
    }
    Ok(())
}

/// Sorted `relative path -> sha256` map of all input files in a workspace.
pub fn workspace_digests(workspace: &Path) -> Result<BTreeMap<String, String>> {
    let mut digests = BTreeMap::new();
    if workspace.is_dir() {
        walk_files(workspace, workspace, true, &mut digests)?;
    }
    Ok(digests)
}

/// SHA-256 hex fingerprint over the canonical cache key.
pub fn fingerprint(job_spec: &Value, workflow_json: &Value, workspace: &Path) -> Result<String> {
    let mut spec = job_spec.clone();
    if let Some(object) = spec.as_object_mut() {
        object.remove("job_id");
    }
    let digests = workspace_digests(workspace)?;
    let key = serde_json::json!({
        "job_spec": spec,
        "workflow_json": workflow_json,
        "input_files": digests,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&key).as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn copy_dir(src: &Path, dst: &Path, skip_top_level: bool) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip_top_level && EXCLUDED_TOP_LEVEL.iter().any(|n| name == *n) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if from.is_dir() {
            copy_dir(&from, &to, false)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Archive the workspace contents under `<workspace>/archive/<fingerprint>/`
/// and return the published path.
pub fn archive_workspace(workspace: &Path, fingerprint: &str) -> Result<PathBuf> {
    let archive_root = workspace.join("archive");
    fs::create_dir_all(&archive_root)?;
    let result_path = archive_root.join(fingerprint);
    let lock_path = archive_root.join(format!("{fingerprint}.lock"));

    let lock_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)?;
    lock_file.lock_exclusive()?;

    let outcome = (|| -> Result<PathBuf> {
        if result_path.is_dir() {
            debug!(fingerprint, "archive already published");
            return Ok(result_path.clone());
        }
        let temp_path = archive_root.join(format!(".tmp-{fingerprint}"));
        if temp_path.exists() {
            // Leftover from a crashed writer.
            fs::remove_dir_all(&temp_path)?;
        }
        copy_dir(workspace, &temp_path, true)?;
        fs::rename(&temp_path, &result_path)?;
        Ok(result_path.clone())
    })();

    FileExt::unlock(&lock_file)?;
    outcome
}

/// Copy an archived result into a workspace. Readers take no lock; the
/// archive is immutable once the rename published it.
pub fn hydrate_workspace(result_path: &Path, workspace: &Path) -> Result<()> {
    if !result_path.is_dir() {
        return Err(JobError::Malformed(format!(
            "cached result path '{}' does not exist",
            result_path.display()
        )));
    }
    copy_dir(result_path, workspace, false)
}

/// A positive cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub fingerprint: String,
    pub result_path: PathBuf,
}

/// Cache façade combining the fingerprint computation, the `job_cache`
/// table and the archive directory.
#[derive(Debug, Clone)]
pub struct JobCache {
    store: JobStore,
    enabled: bool,
}

impl JobCache {
    pub fn new(store: JobStore, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Whether fingerprints are computed at all. Disabled caching skips the
    /// workspace digest pass entirely, which matters on large workspaces.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fingerprint the spec and look the result up. Returns `None` on miss
    /// or when caching is disabled.
    pub async fn check(
        &self,
        job_spec: &Value,
        workflow_json: &Value,
        workspace: &Path,
    ) -> Result<Option<CacheHit>> {
        if !self.enabled {
            return Ok(None);
        }
        let fp = self.fingerprint_blocking(job_spec, workflow_json, workspace).await?;
        self.lookup(&fp).await
    }

    /// Look up an already-computed fingerprint. A hit refreshes the access
    /// timestamp; a row whose archive vanished counts as a miss.
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<CacheHit>> {
        let Some(row) = self.store.cache_lookup(fingerprint).await? else {
            return Ok(None);
        };
        let result_path = PathBuf::from(&row.result_path);
        if !result_path.is_dir() {
            warn!(
                fingerprint,
                path = %result_path.display(),
                "cache row points at a missing archive, treating as miss"
            );
            return Ok(None);
        }
        self.store.cache_touch(fingerprint).await?;
        Ok(Some(CacheHit {
            fingerprint: fingerprint.to_string(),
            result_path,
        }))
    }

    /// Compute the fingerprint off the async runtime; the digest pass reads
    /// every workspace file.
    pub async fn fingerprint_blocking(
        &self,
        job_spec: &Value,
        workflow_json: &Value,
        workspace: &Path,
    ) -> Result<String> {
        let spec = job_spec.clone();
        let workflow = workflow_json.clone();
        let workspace = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || fingerprint(&spec, &workflow, &workspace))
            .await
            .map_err(|e| JobError::Malformed(format!("fingerprint task failed: {e}")))?
    }

    /// Hydrate a workspace from a hit, off the async runtime.
    pub async fn hydrate(&self, hit: &CacheHit, workspace: &Path) -> Result<()> {
        let result_path = hit.result_path.clone();
        let workspace = workspace.to_path_buf();
        tokio::task::spawn_blocking(move || hydrate_workspace(&result_path, &workspace))
            .await
            .map_err(|e| JobError::Malformed(format!("hydration task failed: {e}")))?
    }

    /// Archive a finished job's workspace and publish the cache row. Called
    /// by the monitor exactly once per finished job with a fingerprint.
    pub async fn store_result(&self, workspace: &Path, fingerprint: &str) -> Result<PathBuf> {
        let workspace_owned = workspace.to_path_buf();
        let fp = fingerprint.to_string();
        let result_path =
            tokio::task::spawn_blocking(move || archive_workspace(&workspace_owned, &fp))
                .await
                .map_err(|e| JobError::Malformed(format!("archive task failed: {e}")))??;
        self.store
            .cache_upsert(fingerprint, &result_path.to_string_lossy())
            .await?;
        info!(fingerprint, path = %result_path.display(), "archived job outputs");
        Ok(result_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    fn spec() -> Value {
        serde_json::json!({
            "cmd": "echo hi",
            "docker_img": "busybox",
            "env_vars": {},
            "compute_backend_params": {"backend": "kubernetes"},
        })
    }

    fn workflow() -> Value {
        serde_json::json!({"steps": [{"name": "s1"}]})
    }

    async fn cache() -> JobCache {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = JobStore::new(pool);
        store.init_schema().await.unwrap();
        JobCache::new(store, true)
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"d": 2, "c": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"c": 3, "d": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_fingerprint_deterministic_and_input_sensitive() {
        let ws = TempDir::new().unwrap();
        fs::write(ws.path().join("input.txt"), b"data").unwrap();

        let fp1 = fingerprint(&spec(), &workflow(), ws.path()).unwrap();
        let fp2 = fingerprint(&spec(), &workflow(), ws.path()).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);

        fs::write(ws.path().join("input.txt"), b"other").unwrap();
        let fp3 = fingerprint(&spec(), &workflow(), ws.path()).unwrap();
        assert_ne!(fp1, fp3);

        let mut changed = spec();
        changed["cmd"] = Value::String("echo bye".to_string());
        let fp4 = fingerprint(&changed, &workflow(), ws.path()).unwrap();
        assert_ne!(fp3, fp4);
    }

    #[test]
    fn test_fingerprint_ignores_job_id_and_archive_dir() {
        let ws = TempDir::new().unwrap();
        fs::write(ws.path().join("input.txt"), b"data").unwrap();
        let base = fingerprint(&spec(), &workflow(), ws.path()).unwrap();

        let mut with_id = spec();
        with_id["job_id"] = Value::String("cdcf48b1".to_string());
        assert_eq!(base, fingerprint(&with_id, &workflow(), ws.path()).unwrap());

        fs::create_dir_all(ws.path().join("archive/old")).unwrap();
        fs::write(ws.path().join("archive/old/out.txt"), b"cached").unwrap();
        assert_eq!(base, fingerprint(&spec(), &workflow(), ws.path()).unwrap());
    }

    #[test]
    fn test_archive_then_hydrate_round_trip() {
        let ws = TempDir::new().unwrap();
        fs::create_dir_all(ws.path().join("results")).unwrap();
        fs::write(ws.path().join("results/out.txt"), b"42\n").unwrap();
        fs::write(ws.path().join("log.txt"), b"done\n").unwrap();

        let result_path = archive_workspace(ws.path(), "abc123").unwrap();
        assert!(result_path.ends_with("archive/abc123"));
        assert_eq!(
            fs::read(result_path.join("results/out.txt")).unwrap(),
            b"42\n"
        );

        // Archiving again is a no-op on the published path.
        let again = archive_workspace(ws.path(), "abc123").unwrap();
        assert_eq!(result_path, again);

        let fresh = TempDir::new().unwrap();
        hydrate_workspace(&result_path, fresh.path()).unwrap();
        assert_eq!(fs::read(fresh.path().join("results/out.txt")).unwrap(), b"42\n");
        assert_eq!(fs::read(fresh.path().join("log.txt")).unwrap(), b"done\n");
    }

    #[test]
    fn test_archive_does_not_nest_previous_archives() {
        let ws = TempDir::new().unwrap();
        fs::write(ws.path().join("out.txt"), b"v1").unwrap();
        archive_workspace(ws.path(), "first").unwrap();

        fs::write(ws.path().join("out.txt"), b"v2").unwrap();
        let second = archive_workspace(ws.path(), "second").unwrap();
        assert!(!second.join("archive").exists());
    }

    #[test]
    fn test_hydrate_missing_archive_is_an_error() {
        let ws = TempDir::new().unwrap();
        let missing = ws.path().join("archive/nope");
        assert!(matches!(
            hydrate_workspace(&missing, ws.path()),
            Err(JobError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_check_miss_then_hit() {
        let cache = cache().await;
        let ws = TempDir::new().unwrap();
        fs::write(ws.path().join("input.txt"), b"data").unwrap();

        assert!(cache
            .check(&spec(), &workflow(), ws.path())
            .await
            .unwrap()
            .is_none());

        let fp = cache
            .fingerprint_blocking(&spec(), &workflow(), ws.path())
            .await
            .unwrap();
        cache.store_result(ws.path(), &fp).await.unwrap();

        let hit = cache
            .check(&spec(), &workflow(), ws.path())
            .await
            .unwrap()
            .expect("archived spec should hit");
        assert_eq!(hit.fingerprint, fp);
        assert!(hit.result_path.is_dir());
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = JobStore::new(pool);
        store.init_schema().await.unwrap();
        let cache = JobCache::new(store, false);

        let ws = TempDir::new().unwrap();
        assert!(cache
            .check(&spec(), &workflow(), ws.path())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_row_with_missing_archive_is_a_miss() {
        let cache = cache().await;
        let ws = TempDir::new().unwrap();
        let fp = cache
            .fingerprint_blocking(&spec(), &workflow(), ws.path())
            .await
            .unwrap();
        cache
            .store
            .cache_upsert(&fp, "/nonexistent/archive/path")
            .await
            .unwrap();
        assert!(cache
            .check(&spec(), &workflow(), ws.path())
            .await
            .unwrap()
            .is_none());
    }
}

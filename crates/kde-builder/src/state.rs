//! Persistent per-project state across runs.
//!
//! One JSON object on disk, `project name -> {key -> value}`. The `global`
//! pseudo-project holds run-scoped keys; `/digests` holds checksums of
//! installed template files. Only the build-parent process writes; child
//! processes forward their writes over IPC.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

pub const GLOBAL_PROJECT: &str = "global";
pub const DIGESTS_PROJECT: &str = "/digests";

pub const RESUME_LIST_KEY: &str = "resume-list";
pub const LAST_FAILED_KEY: &str = "last-failed-module-list";
pub const LAST_METADATA_UPDATE_KEY: &str = "last-metadata-update";
pub const FAILURE_COUNT_KEY: &str = "failure-count";
pub const LAST_BUILD_REV_KEY: &str = "last-build-rev";

/// The on-disk store. Loaded once at startup, flushed once at exit.
#[derive(Debug, Default)]
pub struct PersistentState {
    data: BTreeMap<String, BTreeMap<String, Value>>,
    path: PathBuf,
}

impl PersistentState {
    /// Load the store, or start empty when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read state file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse state JSON {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(PersistentState {
            data,
            path: path.to_path_buf(),
        })
    }

    pub fn in_memory() -> Self {
        PersistentState::default()
    }

    /// Flush the whole object. A crash mid-write leaves the previous file
    /// intact (write-to-temp then rename).
    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }
        let json =
            serde_json::to_string_pretty(&self.data).context("failed to serialize state JSON")?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync state file")?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename state file to {}", self.path.display()))?;
        Ok(())
    }

    pub fn get(&self, project: &str, key: &str) -> Option<&Value> {
        self.data.get(project).and_then(|m| m.get(key))
    }

    pub fn get_str(&self, project: &str, key: &str) -> Option<String> {
        match self.get(project, key)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn get_i64(&self, project: &str, key: &str) -> Option<i64> {
        match self.get(project, key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, project: &str, key: &str, value: impl Into<Value>) {
        self.data
            .entry(project.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn unset(&mut self, project: &str, key: &str) {
        if let Some(map) = self.data.get_mut(project) {
            map.remove(key);
            if map.is_empty() {
                self.data.remove(project);
            }
        }
    }

    /// Failure-count bookkeeping used by the build runner.
    pub fn failure_count(&self, project: &str) -> i64 {
        self.get_i64(project, FAILURE_COUNT_KEY).unwrap_or(0)
    }

    pub fn bump_failure_count(&mut self, project: &str) {
        let n = self.failure_count(project);
        self.set(project, FAILURE_COUNT_KEY, n + 1);
    }

    pub fn reset_failure_count(&mut self, project: &str) {
        self.set(project, FAILURE_COUNT_KEY, 0);
    }

    /// Comma-and-space separated project list, the resume format.
    pub fn set_resume_list(&mut self, names: &[String]) {
        if names.is_empty() {
            self.unset(GLOBAL_PROJECT, RESUME_LIST_KEY);
        } else {
            self.set(GLOBAL_PROJECT, RESUME_LIST_KEY, names.join(", "));
        }
    }

    pub fn resume_list(&self) -> Vec<String> {
        self.name_list(RESUME_LIST_KEY)
    }

    pub fn set_last_failed_list(&mut self, names: &[String]) {
        if names.is_empty() {
            self.unset(GLOBAL_PROJECT, LAST_FAILED_KEY);
        } else {
            self.set(GLOBAL_PROJECT, LAST_FAILED_KEY, names.join(", "));
        }
    }

    pub fn last_failed_list(&self) -> Vec<String> {
        self.name_list(LAST_FAILED_KEY)
    }

    fn name_list(&self, key: &str) -> Vec<String> {
        self.get_str(GLOBAL_PROJECT, key)
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// MD5 digest of an installed template file, under `/digests`.
    pub fn digest(&self, file: &str) -> Option<String> {
        self.get_str(DIGESTS_PROJECT, file)
    }

    pub fn set_digest(&mut self, file: &str, digest: &str) {
        self.set(DIGESTS_PROJECT, file, digest);
    }

    /// Drop every key of a project, e.g. after `remove-after-install: all`.
    pub fn forget_project(&mut self, project: &str) {
        self.data.remove(project);
    }

    pub fn projects(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }
}

/// MD5 checksum of a file, hex encoded.
pub fn file_digest(path: &Path) -> Result<String> {
    use md5::{Digest, Md5};
    let bytes =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("state.json");

        let mut st = PersistentState::load(&path).expect("load empty");
        st.set("kcalc", LAST_BUILD_REV_KEY, "abc123");
        st.set("kcalc", FAILURE_COUNT_KEY, 2);
        st.set(GLOBAL_PROJECT, LAST_METADATA_UPDATE_KEY, 1700000000i64);
        st.save().expect("save");

        let reloaded = PersistentState::load(&path).expect("reload");
        assert_eq!(
            reloaded.get_str("kcalc", LAST_BUILD_REV_KEY).as_deref(),
            Some("abc123")
        );
        assert_eq!(reloaded.get_i64("kcalc", FAILURE_COUNT_KEY), Some(2));
    }

    #[test]
    fn save_is_atomic_no_tmp_left_behind() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("state.json");
        let mut st = PersistentState::load(&path).expect("load");
        st.set("a", "k", "v");
        st.save().expect("save");
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn failure_count_bumps_and_resets() {
        let mut st = PersistentState::in_memory();
        assert_eq!(st.failure_count("x"), 0);
        st.bump_failure_count("x");
        st.bump_failure_count("x");
        assert_eq!(st.failure_count("x"), 2);
        st.reset_failure_count("x");
        assert_eq!(st.failure_count("x"), 0);
    }

    #[test]
    fn resume_list_round_trips_as_comma_separated_names() {
        let mut st = PersistentState::in_memory();
        st.set_resume_list(&["r".to_string(), "s".to_string()]);
        assert_eq!(
            st.get_str(GLOBAL_PROJECT, RESUME_LIST_KEY).as_deref(),
            Some("r, s")
        );
        assert_eq!(st.resume_list(), vec!["r", "s"]);

        st.set_resume_list(&[]);
        assert!(st.resume_list().is_empty());
    }

    #[test]
    fn digests_live_under_their_pseudo_project() {
        let mut st = PersistentState::in_memory();
        st.set_digest("session.desktop", "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            st.digest("session.desktop").as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert!(st.projects().any(|p| p == DIGESTS_PROJECT));
    }

    #[test]
    fn file_digest_matches_known_md5() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("empty");
        std::fs::write(&path, b"").expect("write");
        assert_eq!(
            file_digest(&path).expect("digest"),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    proptest! {
        // P10: arbitrary key/value maps survive the disk round trip.
        #[test]
        fn arbitrary_state_round_trips(
            entries in prop::collection::btree_map(
                "[a-z][a-z0-9-]{0,10}",
                prop::collection::btree_map("[a-z-]{1,10}", "[ -~]{0,20}", 0..5),
                0..6,
            )
        ) {
            let td = tempdir().expect("tempdir");
            let path = td.path().join("state.json");
            let mut st = PersistentState::load(&path).expect("load");
            for (project, keys) in &entries {
                for (k, v) in keys {
                    st.set(project, k, v.clone());
                }
            }
            st.save().expect("save");
            let reloaded = PersistentState::load(&path).expect("reload");
            for (project, keys) in &entries {
                for (k, v) in keys {
                    prop_assert_eq!(reloaded.get_str(project, k), Some(v.clone()));
                }
            }
        }
    }
}

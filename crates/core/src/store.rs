//! On-disk profile and macro storage: one pretty-printed JSON file per item.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::macros::Macro;
use crate::profile::Profile;
use crate::safety;

/// Something a [`JsonStore`] can hold.
pub trait Stored: Serialize + DeserializeOwned {
    /// Used in log messages.
    const KIND: &'static str;

    /// File stem under which the item is stored.
    fn key(&self) -> &str;

    fn not_found(key: &str) -> Error;

    fn validate(&self) -> Result<()>;
}

impl Stored for Profile {
    const KIND: &'static str = "profile";

    fn key(&self) -> &str {
        &self.name
    }

    fn not_found(key: &str) -> Error {
        Error::ProfileNotFound(key.to_string())
    }

    fn validate(&self) -> Result<()> {
        safety::validate_profile(self)
    }
}

impl Stored for Macro {
    const KIND: &'static str = "macro";

    fn key(&self) -> &str {
        &self.id
    }

    fn not_found(key: &str) -> Error {
        Error::MacroNotFound(key.to_string())
    }

    fn validate(&self) -> Result<()> {
        safety::validate_macro(self)
    }
}

/// Directory of `<key>.json` files.
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    dir: PathBuf,
    _item: PhantomData<fn() -> T>,
}

impl<T: Stored> JsonStore<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _item: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        safety::validate_store_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// Keys of every stored item, sorted. A missing directory is empty.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if safety::validate_store_key(stem).is_ok() {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn load(&self, key: &str) -> Result<T> {
        let path = self.path(key)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(T::not_found(key)),
            Err(e) => return Err(e.into()),
        };
        let item: T = serde_json::from_str(&text)
            .map_err(|e| Error::Profile(format!("{}: {e}", path.display())))?;
        if item.key() != key {
            warn!(
                kind = T::KIND,
                file = key,
                inner = item.key(),
                "Stored name does not match file name"
            );
        }
        item.validate()?;
        debug!(kind = T::KIND, key, "Loaded");
        Ok(item)
    }

    /// Write atomically (temp file + rename).
    pub fn save(&self, item: &T) -> Result<PathBuf> {
        item.validate()?;
        let path = self.path(item.key())?;
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(item)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(kind = T::KIND, key = item.key(), path = %path.display(), "Saved");
        Ok(path)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(T::not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Every item that loads cleanly; broken files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for key in self.list()? {
            match self.load(&key) {
                Ok(item) => items.push(item),
                Err(e) => warn!(kind = T::KIND, %key, error = %e, "Skipping unreadable entry"),
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyCode;
    use crate::macros::{MacroStep, PlaybackMode};

    #[test]
    fn profile_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Profile> = JsonStore::new(dir.path());
        let mut p = Profile::default();
        p.name = "fps".into();
        p.version = 7;
        store.save(&p).unwrap();
        assert_eq!(store.list().unwrap(), vec!["fps".to_string()]);
        assert_eq!(store.load("fps").unwrap(), p);
    }

    #[test]
    fn macro_roundtrip_keeps_timing() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Macro> = JsonStore::new(dir.path());
        let mut m = Macro::new(
            "burst",
            vec![
                MacroStep::press(KeyCode(30), 0),
                MacroStep::release(KeyCode(30), 37),
            ],
        )
        .with_playback(PlaybackMode::Repeat);
        m.repeat_count = 3;
        m.speed_multiplier = 1.5;
        store.save(&m).unwrap();
        assert_eq!(store.load("burst").unwrap(), m);
    }

    #[test]
    fn missing_entries_map_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let profiles: JsonStore<Profile> = JsonStore::new(dir.path());
        let macros: JsonStore<Macro> = JsonStore::new(dir.path());
        assert!(matches!(profiles.load("nope"), Err(Error::ProfileNotFound(_))));
        assert!(matches!(macros.delete("nope"), Err(Error::MacroNotFound(_))));
    }

    #[test]
    fn missing_directory_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Profile> = JsonStore::new(dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Profile> = JsonStore::new(dir.path());
        assert!(store.load("../secret").is_err());
        let mut p = Profile::default();
        p.name = "a/b".into();
        assert!(store.save(&p).is_err());
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Profile> = JsonStore::new(dir.path());
        store.save(&Profile::default()).unwrap();
        store.delete("default").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn load_all_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Profile> = JsonStore::new(dir.path());
        store.save(&Profile::default()).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
    }
}

//! Directory-backed cache.
//!
//! Layout: `{root}/{type}-{hash}/{key}-{hash}.{ext}`. The type directory
//! keeps entries of different value types apart. Each hash covers the full
//! unsanitized name, so truncated or rewritten names stay unique. Entry age
//! is the file modification time.
//!
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a reader never observes a partial entry.

use std::any::type_name;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use cachet_core::{CacheKey, Freshness};
use cachet_engine::{CacheError, CachePort, Cacheable};

use crate::converter::{JsonConverter, ResponseConverter};

const MAX_NAME_LEN: usize = 64;

/// Persistent [`CachePort`] storing one file per entry.
#[derive(Debug)]
pub struct FileCache<C = JsonConverter> {
    root: PathBuf,
    converter: C,
    temp_seq: AtomicU64,
}

impl FileCache<JsonConverter> {
    /// Open (creating if needed) a JSON cache under `root`.
    pub fn json(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Self::open(root, JsonConverter::new())
    }
}

impl<C: ResponseConverter> FileCache<C> {
    /// Open (creating if needed) a cache under `root`.
    pub fn open(root: impl Into<PathBuf>, converter: C) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| CacheError::creation(format!("{}: {e}", root.display())))?;
        debug!(root = %root.display(), "file cache opened");
        Ok(Self {
            root,
            converter,
            temp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that holds (or would hold) the `T` entry for `key`.
    pub fn entry_path<T: Cacheable>(&self, key: &CacheKey) -> PathBuf {
        self.type_dir::<T>().join(format!(
            "{}.{}",
            hashed_name(key.as_str()),
            self.converter.extension()
        ))
    }

    /// Whether a `T` entry exists for `key`, regardless of age.
    pub fn contains<T: Cacheable>(&self, key: &CacheKey) -> bool {
        self.entry_path::<T>(key).is_file()
    }

    /// Time since the `T` entry for `key` was written.
    pub fn age_of<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<Duration>, CacheError> {
        let path = self.entry_path::<T>(key);
        match fs::metadata(&path) {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .map_err(|e| CacheError::loading(format!("{}: {e}", path.display())))?;
                Ok(Some(
                    SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or(Duration::ZERO),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::loading(format!("{}: {e}", path.display()))),
        }
    }

    /// Delete every entry of every type.
    pub fn remove_all(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::saving(format!("{}: {e}", self.root.display())));
            }
        }
        fs::create_dir_all(&self.root)
            .map_err(|e| CacheError::creation(format!("{}: {e}", self.root.display())))?;
        debug!(root = %self.root.display(), "file cache cleared");
        Ok(())
    }

    fn type_dir<T>(&self) -> PathBuf {
        self.root.join(hashed_name(type_name::<T>()))
    }

    fn read_entry<T: Cacheable>(&self, path: &Path) -> Result<T, CacheError> {
        let file =
            File::open(path).map_err(|e| CacheError::loading(format!("{}: {e}", path.display())))?;
        self.converter
            .restore_object(&mut BufReader::new(file))
            .map_err(|e| CacheError::loading(format!("{}: {e}", path.display())))
    }

    fn write_entry<T: Cacheable>(&self, value: &T, path: &Path) -> Result<(), CacheError> {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let temp = path.with_extension(format!("{seq}.tmp"));

        let written = File::create(&temp)
            .map_err(|e| CacheError::saving(format!("{}: {e}", temp.display())))
            .and_then(|file| {
                self.converter
                    .save_object(value, &mut BufWriter::new(file))
                    .map_err(|e| CacheError::saving(format!("{}: {e}", temp.display())))
            })
            .and_then(|()| {
                fs::rename(&temp, path)
                    .map_err(|e| CacheError::saving(format!("{}: {e}", path.display())))
            });

        if written.is_err() {
            let _ = fs::remove_file(&temp);
        }
        written
    }
}

impl<C: ResponseConverter> CachePort for FileCache<C> {
    fn load<T: Cacheable>(
        &self,
        key: &CacheKey,
        freshness: Freshness,
    ) -> Result<Option<T>, CacheError> {
        if !freshness.allows_cache_read() {
            return Ok(None);
        }

        let Some(age) = self.age_of::<T>(key)? else {
            return Ok(None);
        };
        if freshness.is_expired(age) {
            debug!(%key, age_ms = age.as_millis() as u64, "file cache entry expired");
            return Ok(None);
        }

        self.read_entry(&self.entry_path::<T>(key)).map(Some)
    }

    fn save<T: Cacheable>(&self, value: &T, key: &CacheKey) -> Result<T, CacheError> {
        let dir = self.type_dir::<T>();
        fs::create_dir_all(&dir)
            .map_err(|e| CacheError::creation(format!("{}: {e}", dir.display())))?;

        let path = self.entry_path::<T>(key);
        self.write_entry(value, &path)?;
        self.read_entry(&path)
            .map_err(|e| CacheError::saving(format!("stored entry unreadable: {e}")))
    }

    fn remove<T: Cacheable>(&self, key: &CacheKey) -> Result<(), CacheError> {
        let path = self.entry_path::<T>(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove cache entry");
                Err(CacheError::saving(format!("{}: {e}", path.display())))
            }
        }
    }
}

/// Sanitized name plus a hash of the raw one.
fn hashed_name(raw: &str) -> String {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    format!("{}-{:016x}", sanitize(raw), hasher.finish())
}

/// Keep filesystem-safe characters, bounded length.
fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Repo {
        name: String,
        stars: u32,
    }

    fn repo(stars: u32) -> Repo {
        Repo {
            name: "robots".to_string(),
            stars,
        }
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::new(k).unwrap()
    }

    fn cache() -> (TempDir, FileCache) {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::json(dir.path().join("cache")).unwrap();
        (dir, cache)
    }

    fn backdate(path: &Path, age: Duration) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    #[test]
    fn save_then_load() {
        let (_dir, cache) = cache();
        let stored = cache.save(&repo(3), &key("octo/robots")).unwrap();
        assert_eq!(stored, repo(3));

        let loaded: Option<Repo> = cache
            .load(&key("octo/robots"), Freshness::max_age(Freshness::ONE_MINUTE))
            .unwrap();
        assert_eq!(loaded, Some(repo(3)));
    }

    #[test]
    fn age_comes_from_the_modification_time() {
        let (_dir, cache) = cache();
        cache.save(&repo(3), &key("k")).unwrap();
        backdate(&cache.entry_path::<Repo>(&key("k")), Freshness::ONE_DAY);

        let fresh: Option<Repo> = cache
            .load(&key("k"), Freshness::max_age(Freshness::ONE_HOUR))
            .unwrap();
        assert_eq!(fresh, None);

        let stale: Option<Repo> = cache.load(&key("k"), Freshness::AlwaysValid).unwrap();
        assert_eq!(stale, Some(repo(3)));
        assert!(cache.age_of::<Repo>(&key("k")).unwrap().unwrap() >= Freshness::ONE_DAY);
    }

    #[test]
    fn always_expired_never_reads() {
        let (_dir, cache) = cache();
        cache.save(&repo(3), &key("k")).unwrap();
        let loaded: Option<Repo> = cache.load(&key("k"), Freshness::AlwaysExpired).unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn missing_entry_is_absent() {
        let (_dir, cache) = cache();
        let loaded: Option<Repo> = cache.load(&key("nope"), Freshness::AlwaysValid).unwrap();
        assert_eq!(loaded, None);
        cache.remove::<Repo>(&key("nope")).unwrap();
    }

    #[test]
    fn corrupted_entry_is_a_loading_error() {
        let (_dir, cache) = cache();
        cache.save(&repo(3), &key("k")).unwrap();
        fs::write(cache.entry_path::<Repo>(&key("k")), b"{\"name\": ").unwrap();

        let err = cache
            .load::<Repo>(&key("k"), Freshness::AlwaysValid)
            .unwrap_err();
        assert!(matches!(err, CacheError::Loading(_)));
    }

    #[test]
    fn types_and_keys_do_not_collide() {
        let (_dir, cache) = cache();
        cache.save(&repo(1), &key("a/b")).unwrap();
        cache.save(&repo(2), &key("a_b")).unwrap();
        cache.save(&7u64, &key("a/b")).unwrap();

        let first: Option<Repo> = cache.load(&key("a/b"), Freshness::AlwaysValid).unwrap();
        let second: Option<Repo> = cache.load(&key("a_b"), Freshness::AlwaysValid).unwrap();
        let number: Option<u64> = cache.load(&key("a/b"), Freshness::AlwaysValid).unwrap();
        assert_eq!(first, Some(repo(1)));
        assert_eq!(second, Some(repo(2)));
        assert_eq!(number, Some(7));
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RepositorySnapshot {
        stars: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RepositoryStatistics {
        stars: u32,
    }

    #[test]
    fn long_type_names_sharing_a_prefix_stay_apart() {
        let (_dir, cache) = cache();
        assert_eq!(
            sanitize(type_name::<Vec<RepositorySnapshot>>()),
            sanitize(type_name::<Vec<RepositoryStatistics>>())
        );

        cache
            .save(&vec![RepositorySnapshot { stars: 1 }], &key("k"))
            .unwrap();

        let other: Option<Vec<RepositoryStatistics>> =
            cache.load(&key("k"), Freshness::AlwaysValid).unwrap();
        assert_eq!(other, None);
        assert_ne!(
            cache.entry_path::<Vec<RepositorySnapshot>>(&key("k")),
            cache.entry_path::<Vec<RepositoryStatistics>>(&key("k"))
        );

        cache.remove::<Vec<RepositoryStatistics>>(&key("k")).unwrap();
        assert!(cache.contains::<Vec<RepositorySnapshot>>(&key("k")));
    }

    #[test]
    fn remove_and_remove_all() {
        let (_dir, cache) = cache();
        cache.save(&repo(1), &key("one")).unwrap();
        cache.save(&repo(2), &key("two")).unwrap();

        cache.remove::<Repo>(&key("one")).unwrap();
        assert!(!cache.contains::<Repo>(&key("one")));
        assert!(cache.contains::<Repo>(&key("two")));

        cache.remove_all().unwrap();
        assert!(!cache.contains::<Repo>(&key("two")));
        assert!(cache.root().is_dir());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let (_dir, cache) = cache();
        cache.save(&repo(1), &key("k")).unwrap();
        cache.save(&repo(2), &key("k")).unwrap();

        let dir = cache.entry_path::<Repo>(&key("k"));
        let leftovers = fs::read_dir(dir.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn unwritable_root_is_a_creation_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        let err = FileCache::json(file.join("cache")).unwrap_err();
        assert!(matches!(err, CacheError::Creation(_)));
    }

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize("octo/robots:v2"), "octo_robots_v2");
        assert_eq!(sanitize(""), "_");
        assert_eq!(sanitize(&"x".repeat(200)).len(), MAX_NAME_LEN);
    }
}

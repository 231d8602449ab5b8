//! The RTT cache.
//!
//! Caches the minimum observed RTT for 3-hop (`W-X-Z`) and 4-hop
//! (`W-X-Y-Z`) circuit paths, each with its own enable flag and
//! freshness lifetime, so surrounding pairs that share an anchor-only
//! sub-path don't have to rebuild it.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use crate::error::Failed;
use crate::fingerprint::Fingerprint;
use crate::utils::date::now_unix;
use crate::utils::sync::Mutex;

/// One cached measurement: the RTT in seconds, the path it was measured
/// over, and when it was measured.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheEntry {
    pub rtt: f64,
    pub path: Vec<String>,
    pub time: u64,
}

/// Joins a path into the cache's on-disk key: `fp1-fp2-fp3[-fp4]`.
pub fn path_key(path: &[Fingerprint]) -> String {
    path.iter().map(Fingerprint::as_str).collect::<Vec<_>>().join("-")
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    since_write: usize,
}

/// The engine's shared RTT cache.
///
/// A single mutex guards both the map and the dirty counter so
/// `put` and periodic persistence can't race with each other.
pub struct RttCache {
    inner: Mutex<Inner>,
    path: PathBuf,
    cache_3hop: bool,
    cache_4hop: bool,
    life_3hop: Duration,
    life_4hop: Duration,
    write_every: usize,
}

impl RttCache {
    /// Loads the cache from `path`, creating it (as `{}`) if it doesn't
    /// exist yet.
    pub fn load(
        path: PathBuf,
        cache_3hop: bool, cache_4hop: bool,
        life_3hop: Duration, life_4hop: Duration,
        write_every: usize,
    ) -> Result<Self, Failed> {
        let entries = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|err| {
                error!("Failed to parse cache file {}: {}", path.display(), err);
                Failed
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No cache file at {}, starting empty.", path.display());
                HashMap::new()
            }
            Err(err) => {
                error!("Failed to read cache file {}: {}", path.display(), err);
                return Err(Failed)
            }
        };
        Ok(RttCache {
            inner: Mutex::new(Inner { entries, since_write: 0 }),
            path, cache_3hop, cache_4hop, life_3hop, life_4hop, write_every,
        })
    }

    fn enabled_for(&self, path: &[Fingerprint]) -> bool {
        match path.len() {
            3 => self.cache_3hop,
            4 => self.cache_4hop,
            _ => false,
        }
    }

    fn lifetime_for(&self, path: &[Fingerprint]) -> Duration {
        if path.len() == 3 { self.life_3hop } else { self.life_4hop }
    }

    /// Returns the cached RTT for `path` if a fresh entry exists.
    pub fn get(&self, path: &[Fingerprint]) -> Option<f64> {
        if !self.enabled_for(path) {
            return None
        }
        let key = path_key(path);
        let lifetime = self.lifetime_for(path).as_secs();
        let now = now_unix();
        let inner = self.inner.lock();
        inner.entries.get(&key).and_then(|entry| {
            if entry.time + lifetime > now { Some(entry.rtt) } else { None }
        })
    }

    /// Records a measurement, replacing the stored entry if it was
    /// stale or if `rtt` is smaller than what's stored. Persists the
    /// cache to disk once `write_every` puts have accumulated.
    pub fn put(&self, path: &[Fingerprint], rtt: f64) {
        if !self.enabled_for(path) {
            return
        }
        let key = path_key(path);
        let lifetime = self.lifetime_for(path).as_secs();
        let now = now_unix();
        let should_write = {
            let mut inner = self.inner.lock();
            let replace = match inner.entries.get(&key) {
                None => true,
                Some(existing) => {
                    existing.time + lifetime <= now || rtt < existing.rtt
                }
            };
            if replace {
                inner.entries.insert(key, CacheEntry {
                    rtt,
                    path: path.iter().map(Fingerprint::to_string).collect(),
                    time: now,
                });
            }
            inner.since_write += 1;
            if inner.since_write >= self.write_every {
                inner.since_write = 0;
                true
            }
            else {
                false
            }
        };
        if should_write {
            if let Err(_err) = self.persist() {
                warn!("Periodic cache write failed; will retry next cycle.");
            }
        }
    }

    /// Atomically rewrites the cache file: write to a temp file in the
    /// same directory, then rename over the target, so a crash never
    /// leaves a half-written cache.
    pub fn persist(&self) -> Result<(), Failed> {
        let entries = self.inner.lock().entries.clone();
        write_atomic(&self.path, &entries)
    }
}

fn write_atomic(path: &Path, entries: &HashMap<String, CacheEntry>) -> Result<(), Failed> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| {
        error!("Failed to create temporary cache file in {}: {}", dir.display(), err);
        Failed
    })?;
    let json = serde_json::to_vec_pretty(entries).map_err(|err| {
        error!("Failed to serialize cache: {}", err);
        Failed
    })?;
    tmp.write_all(&json).map_err(|err| {
        error!("Failed to write temporary cache file: {}", err);
        Failed
    })?;
    tmp.persist(path).map_err(|err| {
        error!("Failed to replace cache file {}: {}", path.display(), err);
        Failed
    })?;
    Ok(())
}

/// Merges several per-engine cache files into one, keeping the smaller
/// RTT for any key both files share. Used by the dispatcher once all
/// its engines have exited.
pub fn merge_files(sources: &[PathBuf], dest: &Path) -> Result<(), Failed> {
    let mut merged: HashMap<String, CacheEntry> = HashMap::new();
    for source in sources {
        let data = match fs::read(source) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                error!("Failed to read cache {}: {}", source.display(), err);
                return Err(Failed)
            }
        };
        let entries: HashMap<String, CacheEntry> = serde_json::from_slice(&data)
            .map_err(|err| {
                error!("Failed to parse cache {}: {}", source.display(), err);
                Failed
            })?;
        merge_into(&mut merged, entries);
    }
    write_atomic(dest, &merged)
}

fn merge_into(target: &mut HashMap<String, CacheEntry>, incoming: HashMap<String, CacheEntry>) {
    for (key, entry) in incoming {
        match target.get(&key) {
            Some(existing) if existing.rtt <= entry.rtt => {}
            _ => { target.insert(key, entry); }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    fn fp(c: char) -> Fingerprint {
        Fingerprint::from_str(&c.to_string().repeat(40)).unwrap()
    }

    fn cache() -> RttCache {
        RttCache {
            inner: Mutex::new(Inner { entries: HashMap::new(), since_write: 0 }),
            path: PathBuf::from("/dev/null"),
            cache_3hop: true, cache_4hop: true,
            life_3hop: Duration::from_secs(3600), life_4hop: Duration::from_secs(3600),
            write_every: 1_000_000,
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = cache();
        let path = [fp('A'), fp('B'), fp('C')];
        assert_eq!(cache.get(&path), None);
        cache.put(&path, 0.2);
        assert_eq!(cache.get(&path), Some(0.2));
    }

    #[test]
    fn min_replacement_keeps_smaller_rtt() {
        let cache = cache();
        let path = [fp('A'), fp('B'), fp('C')];
        cache.put(&path, 0.3);
        cache.put(&path, 0.5);
        assert_eq!(cache.get(&path), Some(0.3));
        cache.put(&path, 0.1);
        assert_eq!(cache.get(&path), Some(0.1));
    }

    #[test]
    fn disabled_arity_is_always_a_miss() {
        let mut cache = cache();
        cache.cache_4hop = false;
        let path = [fp('A'), fp('B'), fp('C'), fp('D')];
        cache.put(&path, 0.1);
        assert_eq!(cache.get(&path), None);
    }

    #[test]
    fn merge_keeps_minimum() {
        let mut a = HashMap::new();
        a.insert("K".to_string(), CacheEntry { rtt: 0.4, path: vec![], time: 10 });
        let mut b = HashMap::new();
        b.insert("K".to_string(), CacheEntry { rtt: 0.2, path: vec![], time: 20 });
        let mut merged = HashMap::new();
        merge_into(&mut merged, a);
        merge_into(&mut merged, b);
        assert_eq!(merged["K"].rtt, 0.2);
    }
}

//! Keyed on-disk cache for product-detail records.
//!
//! One JSON file per product id under the cache directory. Reads expire
//! entries lazily; a periodic sweep drops expirees and bounds the directory
//! size. Writes go through a temp file and rename so readers never see a
//! partial entry.

use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use cartwheel_core::error::Result;
use cartwheel_core::types::ProductDetail;

use crate::single_flight::SingleFlight;

#[derive(Debug, Serialize, Deserialize)]
struct DetailEntry {
    product_id: String,
    inserted_at: DateTime<Utc>,
    ttl_secs: u64,
    detail: ProductDetail,
}

impl DetailEntry {
    fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.inserted_at);
        age.num_seconds() >= self.ttl_secs as i64
    }
}

pub struct DetailCache {
    dir: PathBuf,
    ttl: Duration,
    max_entries: usize,
    flights: SingleFlight<ProductDetail>,
}

impl DetailCache {
    pub async fn open(dir: impl Into<PathBuf>, ttl: Duration, max_entries: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            ttl,
            max_entries,
            flights: SingleFlight::new(),
        })
    }

    /// Resolve `product_id` from the cache, or run `fetch` (deduplicated
    /// across concurrent callers) and store its result.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        product_id: &str,
        bypass_cache: bool,
        fetch: F,
    ) -> Result<ProductDetail>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<ProductDetail>> + Send,
    {
        if !bypass_cache {
            if let Some(hit) = self.get(product_id).await {
                debug!(product_id, "Detail cache hit");
                return Ok(hit);
            }
        }
        self.flights
            .run(product_id, || async move {
                let detail = fetch().await?;
                if let Err(e) = self.put(&detail).await {
                    warn!(error = %e, "Detail cache write failed");
                }
                Ok(detail)
            })
            .await
    }

    pub async fn get(&self, product_id: &str) -> Option<ProductDetail> {
        let path = self.path_for(product_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(error = %e, "Detail cache read failed, treating as miss");
                return None;
            }
        };
        let entry: DetailEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Corrupt detail cache entry, removing");
                let _ = tokio::fs::remove_file(&path).await;
                return None;
            }
        };
        if entry.is_expired() {
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        Some(entry.detail)
    }

    pub async fn put(&self, detail: &ProductDetail) -> Result<()> {
        let entry = DetailEntry {
            product_id: detail.product_id.clone(),
            inserted_at: Utc::now(),
            ttl_secs: self.ttl.as_secs(),
            detail: detail.clone(),
        };
        let path = self.path_for(&detail.product_id);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(&entry)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Remove expired entries and, if the directory still exceeds
    /// `max_entries`, the oldest survivors. Returns how many files went.
    pub async fn sweep(&self) -> Result<usize> {
        let mut kept: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {}
                Some("tmp") => {
                    // Leftover from an interrupted write.
                    let stale = item
                        .metadata()
                        .await
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|m| m.elapsed().ok())
                        .is_some_and(|age| age > Duration::from_secs(3600));
                    if stale {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                    continue;
                }
                _ => continue,
            }
            let parsed = tokio::fs::read(&path)
                .await
                .ok()
                .and_then(|raw| serde_json::from_slice::<DetailEntry>(&raw).ok());
            match parsed {
                Some(entry) if entry.is_expired() => {
                    let _ = tokio::fs::remove_file(&path).await;
                    removed += 1;
                }
                Some(entry) => kept.push((path, entry.inserted_at)),
                None => {
                    let _ = tokio::fs::remove_file(&path).await;
                    removed += 1;
                }
            }
        }

        if kept.len() > self.max_entries {
            kept.sort_by_key(|(_, inserted_at)| *inserted_at);
            let excess = kept.len() - self.max_entries;
            for (path, _) in kept.drain(..excess) {
                let _ = tokio::fs::remove_file(&path).await;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Swept detail cache");
        }
        Ok(removed)
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.sweep().await {
                    warn!(error = %e, "Detail cache sweep failed");
                }
            }
        })
    }

    fn path_for(&self, product_id: &str) -> PathBuf {
        // Hash the id so filenames stay fixed-length and filesystem-safe.
        let digest = Sha256::digest(product_id.as_bytes());
        let name: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartwheel_core::error::CartwheelError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn detail(product_id: &str) -> ProductDetail {
        ProductDetail {
            product_id: product_id.to_string(),
            name: "4K Monitor".into(),
            brand: Some("Iiyama".into()),
            category: None,
            url: "https://shop.example/p/monitor".into(),
            images: vec!["https://shop.example/i/monitor.jpg".into()],
            current_price: 329.0,
            original_price: Some(399.0),
            rating: Some(4.4),
            description: None,
            specifications: BTreeMap::from([("panel".into(), "IPS".into())]),
            source: "shop".into(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn round_trips_a_detail() {
        let dir = tempdir().unwrap();
        let cache = DetailCache::open(dir.path(), Duration::from_secs(3600), 16)
            .await
            .unwrap();
        cache.put(&detail("abc")).await.unwrap();

        let got = cache.get("abc").await.unwrap();
        assert_eq!(got.name, "4K Monitor");
        assert_eq!(got.specifications["panel"], "IPS");
        assert!(cache.get("other").await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_removed_on_read() {
        let dir = tempdir().unwrap();
        let cache = DetailCache::open(dir.path(), Duration::from_secs(3600), 16)
            .await
            .unwrap();
        let entry = DetailEntry {
            product_id: "old".into(),
            inserted_at: Utc::now() - chrono::Duration::seconds(7200),
            ttl_secs: 3600,
            detail: detail("old"),
        };
        let path = cache.path_for("old");
        tokio::fs::write(&path, serde_json::to_vec(&entry).unwrap())
            .await
            .unwrap();

        assert!(cache.get("old").await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupt_entry_is_removed_on_read() {
        let dir = tempdir().unwrap();
        let cache = DetailCache::open(dir.path(), Duration::from_secs(3600), 16)
            .await
            .unwrap();
        let path = cache.path_for("bad");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(cache.get("bad").await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_producer() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(
            DetailCache::open(dir.path(), Duration::from_secs(3600), 16)
                .await
                .unwrap(),
        );
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("abc", false, || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(detail("abc"))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // Now on disk; later callers never invoke the producer.
        let got = cache
            .get_or_fetch("abc", false, || async {
                Err(CartwheelError::Cache("should not fetch".into()))
            })
            .await
            .unwrap();
        assert_eq!(got.product_id, "abc");
    }

    #[tokio::test]
    async fn sweep_drops_expired_and_bounds_size() {
        let dir = tempdir().unwrap();
        let cache = DetailCache::open(dir.path(), Duration::from_secs(3600), 2)
            .await
            .unwrap();

        let expired = DetailEntry {
            product_id: "stale".into(),
            inserted_at: Utc::now() - chrono::Duration::seconds(7200),
            ttl_secs: 3600,
            detail: detail("stale"),
        };
        tokio::fs::write(
            cache.path_for("stale"),
            serde_json::to_vec(&expired).unwrap(),
        )
        .await
        .unwrap();

        let oldest = DetailEntry {
            product_id: "oldest".into(),
            inserted_at: Utc::now() - chrono::Duration::seconds(600),
            ttl_secs: 3600,
            detail: detail("oldest"),
        };
        tokio::fs::write(
            cache.path_for("oldest"),
            serde_json::to_vec(&oldest).unwrap(),
        )
        .await
        .unwrap();
        cache.put(&detail("fresh-1")).await.unwrap();
        cache.put(&detail("fresh-2")).await.unwrap();

        let removed = cache.sweep().await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("stale").await.is_none());
        assert!(cache.get("oldest").await.is_none());
        assert!(cache.get("fresh-1").await.is_some());
        assert!(cache.get("fresh-2").await.is_some());
    }
}

//! Channel registry: normalized path -> channel actor, created lazily.

use crate::relay::channel::{ChannelHandle, ChannelSettings, ChannelStats};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Registry of channels by normalized path. Shared by every upgrade; entries live
/// for the lifetime of the process.
pub struct ChannelRegistry {
    settings: ChannelSettings,
    inner: RwLock<HashMap<String, ChannelHandle>>,
}

impl ChannelRegistry {
    pub fn new(settings: ChannelSettings) -> Self {
        Self {
            settings,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Return the channel for `path`, spawning its actor on first use.
    pub async fn get_or_create(&self, path: &str) -> ChannelHandle {
        if let Some(handle) = self.inner.read().await.get(path) {
            return handle.clone();
        }
        let mut g = self.inner.write().await;
        g.entry(path.to_string())
            .or_insert_with(|| {
                log::info!("creating channel for path {}", path);
                ChannelHandle::spawn(path, self.settings.clone())
            })
            .clone()
    }

    pub async fn get(&self, path: &str) -> Option<ChannelHandle> {
        self.inner.read().await.get(path).cloned()
    }

    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Stats of every channel, sorted by path.
    pub async fn stats(&self) -> Vec<ChannelStats> {
        let handles: Vec<ChannelHandle> = {
            let g = self.inner.read().await;
            g.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(stats) = handle.stats().await {
                out.push(stats);
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(ChannelSettings {
            stale_after: Duration::from_secs(1),
        })
    }

    #[tokio::test]
    async fn creation_is_idempotent_per_path() {
        let reg = registry();
        let a = reg.get_or_create("/notes").await;
        let b = reg.get_or_create("/notes").await;
        reg.get_or_create("/cards").await;
        assert_eq!(a.path(), b.path());
        assert_eq!(reg.paths().await, vec!["/cards".to_string(), "/notes".to_string()]);
        assert!(reg.get("/missing").await.is_none());
    }

    #[tokio::test]
    async fn stats_cover_every_channel() {
        let reg = registry();
        reg.get_or_create("/b").await;
        reg.get_or_create("/a").await;
        let stats = reg.stats().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].path, "/a");
        assert!(!stats[0].has_server);
        assert_eq!(stats[1].clients, 0);
    }
}

use std::sync::Arc;

use futures_util::future::{join_all, try_join_all};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::SignalError;
use crate::upstream::{ElementKind, ElementRef, GroupRef, MediaServer, UpstreamError};

/// One playable stream found during discovery. Indices are positional and
/// stable only within a single generation.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub index: u32,
    pub source: ElementRef,
    pub group: GroupRef,
    pub name: Option<String>,
}

/// An all-or-nothing view of the upstream sources, produced by one complete
/// discovery pass.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub generation: u64,
    pub streams: Vec<StreamEntry>,
}

/// Discovers and tracks the playable sources on the media server.
///
/// Readers always see a complete snapshot: the published `Arc` is swapped
/// wholesale once every group's children have been enumerated, and a pass
/// mutex keeps concurrent discoveries from interleaving their results.
pub struct StreamDirectory {
    media: Arc<dyn MediaServer>,
    snapshot: RwLock<Arc<Snapshot>>,
    // Holds the generation counter; owning the lock is owning the pass.
    pass: Mutex<u64>,
}

impl StreamDirectory {
    pub fn new(media: Arc<dyn MediaServer>) -> Self {
        Self {
            media,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            pass: Mutex::new(0),
        }
    }

    /// Run one discovery pass and publish its snapshot.
    pub async fn discover(&self) -> Result<Arc<Snapshot>, SignalError> {
        let mut generation = self.pass.lock().await;

        let groups = self.media.groups().await.map_err(unavailable)?;

        // Enumerate every group's children before anything is published.
        let enumerated = try_join_all(groups.into_iter().map(|group| {
            let media = self.media.clone();
            async move {
                let children = media.children(&group).await?;
                Ok::<_, UpstreamError>((group, children))
            }
        }))
        .await
        .map_err(unavailable)?;

        let mut offered: Vec<(GroupRef, ElementRef)> = Vec::new();
        for (group, children) in enumerated {
            match classify(&children) {
                Some(source) => offered.push((group, source)),
                None => debug!(
                    group = %group.id,
                    children = children.len(),
                    "group has no offerable source, skipping"
                ),
            }
        }

        // Latency accounting feeds the stats surface for every offered
        // stream; enabling it is best-effort and never fails the pass.
        join_all(offered.iter().map(|(group, _)| {
            let media = self.media.clone();
            let group = group.clone();
            async move {
                if let Err(err) = media.enable_latency_stats(&group).await {
                    debug!(group = %group.id, error = %err, "could not enable latency stats");
                }
            }
        }))
        .await;

        // Display names are best-effort; a failed lookup leaves the name out.
        let names = join_all(offered.iter().map(|(_, source)| {
            let media = self.media.clone();
            let source = source.clone();
            async move { media.element_name(&source).await.ok().flatten() }
        }))
        .await;

        *generation += 1;
        let snapshot = Arc::new(Snapshot {
            generation: *generation,
            streams: offered
                .into_iter()
                .zip(names)
                .enumerate()
                .map(|(index, ((group, source), name))| StreamEntry {
                    index: index as u32,
                    source,
                    group,
                    name,
                })
                .collect(),
        });

        *self.snapshot.write().await = snapshot.clone();
        info!(
            generation = snapshot.generation,
            streams = snapshot.streams.len(),
            "stream directory refreshed"
        );
        Ok(snapshot)
    }

    /// The most recently published snapshot.
    pub async fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    /// Resolve a stream by index, discovering first if nothing has been
    /// published yet.
    pub async fn stream(&self, index: u32) -> Result<StreamEntry, SignalError> {
        let snapshot = self.current().await;
        let snapshot = if snapshot.generation == 0 {
            self.discover().await?
        } else {
            snapshot
        };
        snapshot
            .streams
            .get(index as usize)
            .cloned()
            .ok_or(SignalError::UnknownStream(index))
    }
}

/// Pick the group's offerable source, if any: an explicitly tagged source
/// wins; otherwise a group with exactly one child offers that child. A group
/// with several untagged children is assumed to already carry a consumer
/// attachment and is not offered.
fn classify(children: &[ElementRef]) -> Option<ElementRef> {
    children
        .iter()
        .find(|child| child.kind == ElementKind::Source)
        .cloned()
        .or_else(|| match children {
            [only] => Some(only.clone()),
            _ => None,
        })
}

fn unavailable(err: UpstreamError) -> SignalError {
    SignalError::UpstreamUnavailable(err.to_string())
}

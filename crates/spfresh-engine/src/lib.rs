#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! The update and search engine (§4.G, §4.H, §4.J): wires the version
//! map, posting store, routing layer and head index behind a single
//! `Engine` handle that owns every subsystem instead of reaching for
//! process-global state (§9 "global state -> explicit Engine handle").

mod buffer;
mod heads;
mod metadata;
mod records;
mod search;
mod update;

pub use buffer::{BufferRecord, LoggedRecord, PersistentBuffer};
pub use metadata::MetadataStore;
pub use records::{decode as decode_records, encode as encode_records, PostingRecord};
pub use search::{SearchHit, SearchOptions};
pub use update::{AppendJob, UpdateEngine};

use spfresh_core::ids::Vid;
use spfresh_core::{EngineConfig, Metric, SpfreshError, ValueType};
use spfresh_device::BlockDevice;
use spfresh_head::routing::RoutingLayer;
use spfresh_head::{HeadIndex, HnswHeadIndex};
use spfresh_store::PostingStore;
use spfresh_version::VersionMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk layout rooted at `--index-dir` (§6). The block device itself
/// lives wherever `--spdk-map` points, since it is a distinct required flag.
struct Paths {
    mapping: PathBuf,
    version_map: PathBuf,
    buffer: PathBuf,
    heads: PathBuf,
    metadata: PathBuf,
}

impl Paths {
    fn new(index_dir: &Path) -> Self {
        Self {
            mapping: index_dir.join("mapping.bin"),
            version_map: index_dir.join("version_map.bin"),
            buffer: index_dir.join("buffer.log"),
            heads: index_dir.join("heads.bin"),
            metadata: index_dir.join("metadata.bin"),
        }
    }
}

/// Everything the update and search paths need, held behind one handle
/// instead of scattered statics (§9).
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub version_map: Arc<VersionMap>,
    pub store: Arc<PostingStore>,
    pub routing: Arc<RoutingLayer<HnswHeadIndex>>,
    pub buffer: Arc<PersistentBuffer>,
    pub metadata: Arc<MetadataStore>,
    pub dim: usize,
    pub value_type: ValueType,
    pub metric: Metric,
    version_map_path: PathBuf,
    heads_path: PathBuf,
    metadata_path: PathBuf,
    update: UpdateEngine,
}

impl Engine {
    /// Open (or create) an engine rooted at `index_dir`, replaying the
    /// persistent buffer against the recovered version map, posting
    /// store and routing table so post-recovery state equals pre-crash
    /// state plus whatever prefix of the buffer had already landed
    /// (§4.J).
    pub fn open(
        index_dir: &Path,
        device_path: &Path,
        dim: usize,
        value_type: ValueType,
        metric: Metric,
        capacity_blocks: u64,
        config: EngineConfig,
    ) -> Result<Self, SpfreshError> {
        std::fs::create_dir_all(index_dir)
            .map_err(|e| SpfreshError::Corrupted(format!("creating index dir: {e}")))?;
        let paths = Paths::new(index_dir);

        let device: Arc<dyn BlockDevice> = Arc::new(
            spfresh_device::open(device_path, capacity_blocks)
                .map_err(|e| SpfreshError::Corrupted(format!("opening block device: {e}")))?,
        );
        let store = Arc::new(PostingStore::open(device, paths.mapping.clone())?);

        let version_map = Arc::new(
            VersionMap::load(&paths.version_map)
                .map_err(|e| SpfreshError::Corrupted(format!("loading version map: {e}")))?,
        );

        let head = Arc::new(HnswHeadIndex::new(dim, metric));
        for (hid, vector) in heads::load(&paths.heads, dim)
            .map_err(|e| SpfreshError::Corrupted(format!("loading head snapshot: {e}")))?
        {
            head.add(hid, vector);
        }
        let routing = Arc::new(RoutingLayer::new(head));

        let buffer = Arc::new(PersistentBuffer::open(paths.buffer.clone())?);
        let metadata = Arc::new(MetadataStore::load(&paths.metadata)?);
        let config = Arc::new(config);

        let engine = Self {
            config: Arc::clone(&config),
            version_map: Arc::clone(&version_map),
            store: Arc::clone(&store),
            routing: Arc::clone(&routing),
            buffer: Arc::clone(&buffer),
            metadata,
            dim,
            value_type,
            metric,
            version_map_path: paths.version_map.clone(),
            heads_path: paths.heads.clone(),
            metadata_path: paths.metadata.clone(),
            update: UpdateEngine::new(
                config,
                version_map,
                store,
                routing,
                buffer,
                dim,
                value_type,
            ),
        };
        engine.recover(&paths.buffer)?;
        Ok(engine)
    }

    /// Replay the persistent buffer (§4.J step 2): re-allocate any vid the
    /// crashed run had already allocated, restore tombstones/versions,
    /// and re-enqueue any insert whose append job had not yet landed in a
    /// posting, so it runs again under the new process.
    fn recover(&self, buffer_path: &Path) -> Result<(), SpfreshError> {
        let records = PersistentBuffer::replay(buffer_path)?;
        if records.is_empty() {
            return Ok(());
        }
        tracing::info!(count = records.len(), "replaying persistent buffer");
        for logged in records {
            tracing::trace!(seq = logged.seq, "replaying buffer record");
            match logged.record {
                BufferRecord::Insert { vid, vector } => {
                    self.version_map.observe_vid(vid);
                    self.update.replay_insert(vid, vector)?;
                }
                BufferRecord::Delete { vid } => {
                    self.version_map.observe_vid(vid);
                    self.version_map.set_deleted(vid);
                }
                BufferRecord::Reassign { vid, version } => {
                    self.version_map.observe_vid(vid);
                    self.version_map.set_version(vid, version);
                }
            }
        }
        Ok(())
    }

    pub fn insert(&self, vector: Vec<f32>) -> Result<Vid, SpfreshError> {
        self.update.insert(vector)
    }

    pub fn insert_batch(&self, vectors: Vec<Vec<f32>>) -> Result<Vec<Vid>, SpfreshError> {
        vectors.into_iter().map(|v| self.update.insert(v)).collect()
    }

    /// Insert with an opaque metadata byte-string attached (§1, §10.6.2).
    /// The metadata is kept in a sidecar store keyed by `Vid`, separate
    /// from the posting records themselves, and is not replicated or
    /// searched.
    pub fn insert_with_metadata(
        &self,
        vector: Vec<f32>,
        metadata: Vec<u8>,
    ) -> Result<Vid, SpfreshError> {
        let vid = self.update.insert(vector)?;
        self.metadata.set(vid, metadata);
        Ok(vid)
    }

    pub fn metadata(&self, vid: Vid) -> Option<Vec<u8>> {
        self.metadata.get(vid)
    }

    pub fn delete(&self, vid: Vid) -> Result<(), SpfreshError> {
        self.metadata.remove(vid);
        self.update.delete(vid)
    }

    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>, SpfreshError> {
        search::search(self, query, k, opts)
    }

    /// Block until every queued append job has drained (used by the
    /// trace harness between batches and by tests).
    pub fn drain(&self) {
        self.update.drain();
    }

    /// Graceful shutdown (§5): stop workers, flush the mapping table and
    /// version map, then truncate the persistent buffer now that every
    /// record in it is durably reflected elsewhere.
    pub fn shutdown(&self) -> Result<(), SpfreshError> {
        self.update.shutdown();
        self.store.flush_mapping()?;
        self.version_map
            .save(&self.version_map_path)
            .map_err(|e| SpfreshError::Corrupted(format!("saving version map: {e}")))?;
        heads::save(&self.heads_path, &self.routing.head().snapshot(), self.dim)
            .map_err(|e| SpfreshError::Corrupted(format!("saving head snapshot: {e}")))?;
        self.metadata.save(&self.metadata_path)?;
        self.buffer.truncate()?;
        Ok(())
    }
}

//! File I/O facade

use crate::selector::{AdaptiveSelector, ExplicitSelector, ModeSelector, SelectionStats};
use pollfs_config::{Config, ConfigLoader};
use pollfs_io::{
    AsyncOperation, FileEngine, MmapEngine, PooledAllocator, PositionalEngine, RingContext,
    RingEngine,
};
use pollfs_types::{
    Access, Allocator, AppendRequest, FileMode, ReadRequest, Result, WriteRequest,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point owning every strategy and the selector choosing between them
pub struct FileIo {
    config: Arc<Config>,
    selector: Arc<dyn ModeSelector>,
    allocator: Arc<dyn Allocator>,
    mmap: MmapEngine,
    standard: PositionalEngine,
    direct: PositionalEngine,
    ring: RingEngine,
    ring_fallbacks: AtomicU64,
}

impl FileIo {
    /// Create a facade from the default configuration sources
    pub fn new() -> Result<Self> {
        let config = ConfigLoader::load_default()?;
        Ok(Self::with_config(config))
    }

    /// Create a facade with custom configuration
    pub fn with_config(config: Config) -> Self {
        FileIoBuilder::new().with_config(config).build()
    }

    /// Builder for custom selectors, allocators or ring contexts
    pub fn builder() -> FileIoBuilder {
        FileIoBuilder::new()
    }

    /// Start a read with the strategy chosen for it
    pub fn read<'a>(&self, request: ReadRequest<'a>) -> AsyncOperation<'a> {
        let mode = self.route(request.mode, request.validate().map(|()| request.access()));
        self.engine(mode).read(request.with_mode(mode))
    }

    /// Start a positioned write with the strategy chosen for it
    pub fn write<'a>(&self, request: WriteRequest<'a>) -> AsyncOperation<'a> {
        let mode = self.route(request.mode, request.validate().map(|()| request.access()));
        self.engine(mode).write(request.with_mode(mode))
    }

    /// Start an append with the strategy chosen for it
    pub fn append<'a>(&self, request: AppendRequest<'a>) -> AsyncOperation<'a> {
        self.write(request.into())
    }

    /// Engine serving `mode`; `Auto` maps to memory mapping
    pub fn engine(&self, mode: FileMode) -> &dyn FileEngine {
        match mode {
            FileMode::Standard => &self.standard,
            FileMode::Direct => &self.direct,
            FileMode::RingBased => &self.ring,
            FileMode::Auto | FileMode::Mmap => &self.mmap,
        }
    }

    /// Whether the ring strategy can run here
    pub fn ring_available(&self) -> bool {
        self.ring.is_available()
    }

    /// The shared ring context
    pub fn ring_context(&self) -> &Arc<RingContext> {
        self.ring.context()
    }

    /// Allocator behind direct and ring buffers
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// The selector consulted for `Auto` requests
    pub fn selector(&self) -> &Arc<dyn ModeSelector> {
        &self.selector
    }

    /// Selections made by the selector so far
    pub fn selection_stats(&self) -> SelectionStats {
        self.selector.stats()
    }

    /// Ring requests redirected to memory mapping because the ring is unavailable
    pub fn ring_fallbacks(&self) -> u64 {
        self.ring_fallbacks.load(Ordering::Relaxed)
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Decide the concrete mode for a request
    ///
    /// An explicit mode on the request wins, then a configured default mode, then
    /// the selector. Invalid requests are not profiled; their engine fails them
    /// before touching any resource.
    fn route(&self, requested: FileMode, access: Result<Access>) -> FileMode {
        let requested = match requested {
            FileMode::Auto => self.config.io.default_mode,
            explicit => explicit,
        };

        let Ok(access) = access else {
            return self.resolve(requested);
        };

        let mode = match requested {
            FileMode::Auto => self.selector.select(&access),
            explicit => explicit,
        };
        self.selector.record(&access);
        self.resolve(mode)
    }

    fn resolve(&self, mode: FileMode) -> FileMode {
        match mode {
            FileMode::RingBased if !self.ring.is_available() => {
                self.ring_fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!("Ring I/O is unavailable, falling back to memory mapping");
                FileMode::Mmap
            }
            FileMode::Auto => FileMode::Mmap,
            mode => mode,
        }
    }
}

impl fmt::Debug for FileIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileIo")
            .field("selector", &self.selector)
            .field("direct", &self.direct)
            .field("ring", &self.ring)
            .field("ring_fallbacks", &self.ring_fallbacks())
            .finish_non_exhaustive()
    }
}

/// Builder for creating a [`FileIo`] with custom parts
#[derive(Default)]
pub struct FileIoBuilder {
    config: Option<Config>,
    selector: Option<Arc<dyn ModeSelector>>,
    allocator: Option<Arc<dyn Allocator>>,
    ring: Option<Arc<RingContext>>,
}

impl FileIoBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the adaptive selector
    pub fn with_selector(mut self, selector: Arc<dyn ModeSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Always use one strategy for `Auto` requests
    pub fn with_mode(self, mode: FileMode) -> Self {
        self.with_selector(Arc::new(ExplicitSelector::new(mode)))
    }

    /// Replace the pooled allocator
    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Share an existing ring context
    pub fn with_ring(mut self, ring: Arc<RingContext>) -> Self {
        self.ring = Some(ring);
        self
    }

    /// Build the facade
    pub fn build(self) -> FileIo {
        let config = self.config.unwrap_or_default();

        let allocator = self.allocator.unwrap_or_else(|| {
            Arc::new(PooledAllocator::new(
                config.io.pool_block_size,
                config.io.pool_max_blocks,
            ))
        });
        let ring = RingEngine::new(self.ring.unwrap_or_else(|| {
            Arc::new(RingContext::new(
                config.io.ring_queue_depth,
                Arc::clone(&allocator),
            ))
        }));
        let selector = self.selector.unwrap_or_else(|| {
            Arc::new(AdaptiveSelector::new(
                config.selection.clone(),
                ring.is_available(),
            ))
        });
        let direct = PositionalEngine::direct(Arc::clone(&allocator), config.io.direct_alignment);

        debug!("Using selector {:?}", selector);
        info!(
            "File I/O initialised (default mode: {}, ring available: {})",
            config.io.default_mode,
            ring.is_available()
        );

        FileIo {
            config: Arc::new(config),
            selector,
            allocator,
            mmap: MmapEngine,
            standard: PositionalEngine::standard(),
            direct,
            ring,
            ring_fallbacks: AtomicU64::new(0),
        }
    }
}

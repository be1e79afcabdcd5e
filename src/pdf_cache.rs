use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{ChonkerResult, ErrorContext};
use crate::matrix::CharacterMatrix;
use crate::renderer::PageRenderer;

/// Display width assumed until the first request says otherwise
const DEFAULT_DISPLAY_WIDTH: u32 = 100;

/// Undrained completion events kept per cache slot
const EVENT_BACKLOG_PER_SLOT: usize = 2;

// ============= PAGE CACHE TYPES =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityTier {
    Low,
    High,
}

/// An immutable resident page. Upgrades swap the whole entry.
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub page_index: usize,
    pub raster: Arc<RgbImage>,
    pub dpi: f32,
    pub quality_tier: QualityTier,
    pub matrix: Option<Arc<CharacterMatrix>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unrequested,
    Prefetching,
    Ready,
    Evicted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
    pub capacity: usize,
    pub in_flight: usize,
}

/// Background render completion, keyed by page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderEvent {
    pub page_index: usize,
    pub tier: QualityTier,
}

// ============= LRU =============

struct LruCache {
    pages: HashMap<usize, Arc<CachedPage>>,
    access_order: VecDeque<usize>,
    max_size: usize,
}

impl LruCache {
    fn new(max_size: usize) -> Self {
        Self {
            pages: HashMap::new(),
            access_order: VecDeque::new(),
            max_size,
        }
    }

    fn get(&mut self, page: usize) -> Option<Arc<CachedPage>> {
        let data = self.pages.get(&page).cloned()?;
        // Move to front (most recently used)
        self.access_order.retain(|&p| p != page);
        self.access_order.push_front(page);
        Some(data)
    }

    fn peek(&self, page: usize) -> Option<&Arc<CachedPage>> {
        self.pages.get(&page)
    }

    /// Inserts as most recently used, returning whatever was evicted.
    fn insert(&mut self, page: usize, data: Arc<CachedPage>) -> Vec<usize> {
        self.access_order.retain(|&p| p != page);
        self.access_order.push_front(page);
        self.pages.insert(page, data);

        let mut evicted = Vec::new();
        while self.pages.len() > self.max_size {
            match self.access_order.pop_back() {
                Some(lru_page) => {
                    self.pages.remove(&lru_page);
                    evicted.push(lru_page);
                }
                None => break,
            }
        }
        evicted
    }

    /// Swaps a resident entry without touching recency.
    fn replace(&mut self, page: usize, data: Arc<CachedPage>) -> bool {
        match self.pages.get_mut(&page) {
            Some(slot) => {
                *slot = data;
                true
            }
            None => false,
        }
    }

    fn keys_mru(&self) -> Vec<usize> {
        self.access_order.iter().copied().collect()
    }

    fn len(&self) -> usize {
        self.pages.len()
    }

    fn clear(&mut self) {
        self.pages.clear();
        self.access_order.clear();
    }
}

// ============= SHARED STATE =============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderKind {
    /// Neighbour render; re-inserts even if the page was evicted meanwhile
    Prefetch,
    /// High tier for a page already shown at Low; dropped once evicted
    Upgrade,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    tier: QualityTier,
    kind: RenderKind,
}

struct CacheState {
    lru: LruCache,
    current_index: Option<usize>,
    current: Option<Arc<CachedPage>>,
    prev_prefetch: Option<Arc<CachedPage>>,
    next_prefetch: Option<Arc<CachedPage>>,
    in_flight: HashMap<usize, InFlight>,
    evicted: HashSet<usize>,
    hits: u64,
    misses: u64,
    active_dpi: f32,
}

impl CacheState {
    /// Inserts a finished render unless a better tier is already resident.
    /// Returns the entry that ends up resident.
    fn install(&mut self, page: Arc<CachedPage>) -> Arc<CachedPage> {
        let index = page.page_index;
        if let Some(existing) = self.lru.peek(index) {
            if existing.quality_tier > page.quality_tier {
                return self.lru.get(index).unwrap_or(page);
            }
        }

        let page = self.carry_matrix(page);
        for evicted in self.lru.insert(index, Arc::clone(&page)) {
            debug!("Evicted page {} from render cache", evicted + 1);
            self.evicted.insert(evicted);
        }
        self.evicted.remove(&index);
        page
    }

    /// Keeps an attached matrix across raster swaps.
    fn carry_matrix(&self, page: Arc<CachedPage>) -> Arc<CachedPage> {
        match self.lru.peek(page.page_index).and_then(|old| old.matrix.clone()) {
            Some(matrix) if page.matrix.is_none() => Arc::new(CachedPage {
                matrix: Some(matrix),
                ..(*page).clone()
            }),
            _ => page,
        }
    }

    fn set_current(&mut self, page: Arc<CachedPage>) {
        self.current_index = Some(page.page_index);
        self.current = Some(page);
        self.refresh_neighbours();
    }

    fn refresh_neighbours(&mut self) {
        let Some(index) = self.current_index else {
            self.prev_prefetch = None;
            self.next_prefetch = None;
            return;
        };
        self.prev_prefetch = index
            .checked_sub(1)
            .and_then(|prev| self.lru.peek(prev).cloned());
        self.next_prefetch = self.lru.peek(index + 1).cloned();
    }
}

struct CacheShared {
    state: Mutex<CacheState>,
    idle: Condvar,
    renderer: Arc<dyn PageRenderer>,
    events: SyncSender<RenderEvent>,
}

impl CacheShared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, page_index: usize, dpi: f32, result: ChonkerResult<RgbImage>) {
        let mut state = self.lock();
        let flight = state.in_flight.remove(&page_index);

        match (flight, result) {
            (Some(flight), Ok(raster)) => {
                let rendered = Arc::new(CachedPage {
                    page_index,
                    raster: Arc::new(raster),
                    dpi,
                    quality_tier: flight.tier,
                    matrix: None,
                });

                let resident_tier = state.lru.peek(page_index).map(|p| p.quality_tier);
                let applied = match (resident_tier, flight.kind) {
                    (Some(tier), _) if tier > flight.tier => false,
                    (Some(_), _) => {
                        let rendered = state.carry_matrix(rendered);
                        state.lru.replace(page_index, Arc::clone(&rendered));
                        if state.current_index == Some(page_index) {
                            state.current = Some(rendered);
                        }
                        true
                    }
                    (None, RenderKind::Prefetch) => {
                        state.install(rendered);
                        true
                    }
                    (None, RenderKind::Upgrade) => {
                        debug!("Page {} evicted before its upgrade finished", page_index + 1);
                        false
                    }
                };

                if applied {
                    state.refresh_neighbours();
                    let event = RenderEvent {
                        page_index,
                        tier: flight.tier,
                    };
                    if let Err(TrySendError::Full(_)) = self.events.try_send(event) {
                        debug!("Event backlog full, dropped completion of page {}", page_index + 1);
                    }
                }
            }
            (_, Err(e)) => {
                warn!(
                    error = %e,
                    "Background render of page {} failed",
                    page_index + 1
                );
            }
            (None, Ok(_)) => {}
        }

        if state.in_flight.is_empty() {
            self.idle.notify_all();
        }
    }
}

// ============= RENDER CACHE =============

/// Bounded page raster cache with neighbour prefetch and progressive
/// Low to High upgrades. All bookkeeping sits behind one lock; renders run
/// outside it.
pub struct RenderCache {
    shared: Arc<CacheShared>,
    config: CacheConfig,
    page_count: Option<usize>,
    pool: rayon::ThreadPool,
    events: Mutex<Receiver<RenderEvent>>,
}

impl RenderCache {
    pub fn new(renderer: Arc<dyn PageRenderer>, config: CacheConfig) -> ChonkerResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.max(1))
            .thread_name(|i| format!("chonker-render-{}", i))
            .build()
            .with_context("render worker pool")?;

        let page_count = renderer.page_count();
        let (tx, rx) = mpsc::sync_channel(config.capacity.max(1) * EVENT_BACKLOG_PER_SLOT);
        let state = CacheState {
            lru: LruCache::new(config.capacity.max(1)),
            current_index: None,
            current: None,
            prev_prefetch: None,
            next_prefetch: None,
            in_flight: HashMap::new(),
            evicted: HashSet::new(),
            hits: 0,
            misses: 0,
            active_dpi: config.dpi_tiers.select(DEFAULT_DISPLAY_WIDTH),
        };

        Ok(Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(state),
                idle: Condvar::new(),
                renderer,
                events: tx,
            }),
            config,
            page_count,
            pool,
            events: Mutex::new(rx),
        })
    }

    pub fn page_count(&self) -> Option<usize> {
        self.page_count
    }

    /// Consumer entry point. Resident pages return immediately at whatever
    /// tier they hold; a miss renders synchronously at Low (or High when
    /// progressive loading is off) and schedules the High upgrade.
    pub fn request(&self, page_index: usize, display_width: u32) -> ChonkerResult<Arc<CachedPage>> {
        let dpi = self.config.dpi_tiers.select(display_width);

        {
            let mut state = self.shared.lock();
            state.active_dpi = dpi;
            if let Some(hit) = state.lru.get(page_index) {
                state.hits += 1;
                state.set_current(Arc::clone(&hit));
                if hit.quality_tier < QualityTier::High {
                    self.schedule(&mut state, page_index, dpi, RenderKind::Upgrade);
                }
                drop(state);
                self.prefetch_if_enabled(page_index);
                return Ok(hit);
            }
            state.misses += 1;
        }

        let (tier, render_dpi) = if self.config.progressive {
            (QualityTier::Low, self.config.low_tier_dpi)
        } else {
            (QualityTier::High, dpi)
        };
        let raster = self.shared.renderer.render(page_index, render_dpi)?;

        let page = {
            let mut state = self.shared.lock();
            let page = state.install(Arc::new(CachedPage {
                page_index,
                raster: Arc::new(raster),
                dpi: render_dpi,
                quality_tier: tier,
                matrix: None,
            }));
            state.set_current(Arc::clone(&page));
            if page.quality_tier < QualityTier::High {
                self.schedule(&mut state, page_index, dpi, RenderKind::Upgrade);
            }
            page
        };

        self.prefetch_if_enabled(page_index);
        Ok(page)
    }

    /// Synchronous fetch at an explicit tier. A resident entry at or above
    /// `tier` is a hit; anything else renders on the calling thread.
    pub fn request_tier(&self, page_index: usize, tier: QualityTier) -> ChonkerResult<Arc<CachedPage>> {
        let dpi = {
            let mut state = self.shared.lock();
            let resident = state
                .lru
                .peek(page_index)
                .map_or(false, |page| page.quality_tier >= tier);
            if resident {
                if let Some(hit) = state.lru.get(page_index) {
                    state.hits += 1;
                    state.set_current(Arc::clone(&hit));
                    return Ok(hit);
                }
            }
            state.misses += 1;
            match tier {
                QualityTier::Low => self.config.low_tier_dpi,
                QualityTier::High => state.active_dpi,
            }
        };

        let raster = self.shared.renderer.render(page_index, dpi)?;

        let mut state = self.shared.lock();
        let page = state.install(Arc::new(CachedPage {
            page_index,
            raster: Arc::new(raster),
            dpi,
            quality_tier: tier,
            matrix: None,
        }));
        state.set_current(Arc::clone(&page));
        Ok(page)
    }

    /// Renders `page_index - 1` and `page_index + 1` at High on the worker
    /// pool. Pages past the end of the document are skipped.
    pub fn prefetch(&self, page_index: usize) {
        let mut state = self.shared.lock();
        let dpi = state.active_dpi;

        for neighbour in [page_index.checked_sub(1), page_index.checked_add(1)]
            .into_iter()
            .flatten()
        {
            if self.page_count.map_or(false, |count| neighbour >= count) {
                continue;
            }
            let ready = state
                .lru
                .peek(neighbour)
                .map_or(false, |page| page.quality_tier == QualityTier::High);
            if !ready {
                self.schedule(&mut state, neighbour, dpi, RenderKind::Prefetch);
            }
        }
    }

    fn prefetch_if_enabled(&self, page_index: usize) {
        if self.config.prefetch_adjacent {
            self.prefetch(page_index);
        }
    }

    fn schedule(&self, state: &mut CacheState, page_index: usize, dpi: f32, kind: RenderKind) {
        // A High render already in flight doubles as the upgrade. It keeps its
        // own kind so a prefetch still re-inserts after eviction.
        if state.in_flight.contains_key(&page_index) {
            return;
        }
        if kind == RenderKind::Upgrade && !self.config.progressive {
            return;
        }

        state.in_flight.insert(
            page_index,
            InFlight {
                tier: QualityTier::High,
                kind,
            },
        );
        debug!("Scheduled {:?} render of page {} at {} DPI", kind, page_index + 1, dpi);

        let shared = Arc::clone(&self.shared);
        self.pool.spawn(move || {
            let result = shared.renderer.render(page_index, dpi);
            shared.complete(page_index, dpi, result);
        });
    }

    /// Stores a matrix alongside the resident raster for `page_index`.
    pub fn attach_matrix(&self, page_index: usize, matrix: CharacterMatrix) -> bool {
        let mut state = self.shared.lock();
        let Some(existing) = state.lru.peek(page_index).cloned() else {
            return false;
        };
        let updated = Arc::new(CachedPage {
            matrix: Some(Arc::new(matrix)),
            ..(*existing).clone()
        });
        state.lru.replace(page_index, Arc::clone(&updated));
        if state.current_index == Some(page_index) {
            state.current = Some(updated);
        }
        state.refresh_neighbours();
        true
    }

    pub fn slot_state(&self, page_index: usize) -> SlotState {
        let state = self.shared.lock();
        if state.lru.peek(page_index).is_some() {
            SlotState::Ready
        } else if state.in_flight.contains_key(&page_index) {
            SlotState::Prefetching
        } else if state.evicted.contains(&page_index) {
            SlotState::Evicted
        } else {
            SlotState::Unrequested
        }
    }

    /// Whether a background result for `page_index` should be redisplayed.
    pub fn is_current(&self, page_index: usize) -> bool {
        self.shared.lock().current_index == Some(page_index)
    }

    pub fn current(&self) -> Option<Arc<CachedPage>> {
        self.shared.lock().current.clone()
    }

    pub fn prev_prefetch(&self) -> Option<Arc<CachedPage>> {
        self.shared.lock().prev_prefetch.clone()
    }

    pub fn next_prefetch(&self) -> Option<Arc<CachedPage>> {
        self.shared.lock().next_prefetch.clone()
    }

    /// Resident page indices, most recently used first.
    pub fn resident_pages(&self) -> Vec<usize> {
        self.shared.lock().lru.keys_mru()
    }

    /// Pending completions, oldest first. Once `2 * capacity` events are
    /// waiting, later completions are not queued.
    pub fn drain_events(&self) -> Vec<RenderEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.try_iter().collect()
    }

    pub fn statistics(&self) -> CacheStatistics {
        let state = self.shared.lock();
        CacheStatistics {
            hits: state.hits,
            misses: state.misses,
            resident: state.lru.len(),
            capacity: state.lru.max_size,
            in_flight: state.in_flight.len(),
        }
    }

    /// Blocks until no background render is pending. Returns `false` on
    /// timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |state| !state.in_flight.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        state.in_flight.is_empty()
    }

    /// Drops every resident page and resets statistics. Renders already in
    /// flight still finish.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.lru.clear();
        state.current_index = None;
        state.current = None;
        state.prev_prefetch = None;
        state.next_prefetch = None;
        state.evicted.clear();
        state.hits = 0;
        state.misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(index: usize, tier: QualityTier) -> Arc<CachedPage> {
        Arc::new(CachedPage {
            page_index: index,
            raster: Arc::new(RgbImage::new(1, 1)),
            dpi: 72.0,
            quality_tier: tier,
            matrix: None,
        })
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let mut lru = LruCache::new(2);
        assert!(lru.insert(1, page(1, QualityTier::Low)).is_empty());
        assert!(lru.insert(2, page(2, QualityTier::Low)).is_empty());
        assert!(lru.get(1).is_some());

        assert_eq!(lru.insert(3, page(3, QualityTier::Low)), vec![2]);
        assert_eq!(lru.keys_mru(), vec![3, 1]);
    }

    #[test]
    fn test_lru_replace_keeps_order() {
        let mut lru = LruCache::new(3);
        lru.insert(1, page(1, QualityTier::Low));
        lru.insert(2, page(2, QualityTier::Low));

        assert!(lru.replace(1, page(1, QualityTier::High)));
        assert!(!lru.replace(9, page(9, QualityTier::High)));
        assert_eq!(lru.keys_mru(), vec![2, 1]);
        assert_eq!(lru.peek(1).map(|p| p.quality_tier), Some(QualityTier::High));
    }

    #[test]
    fn test_install_never_downgrades() {
        let mut state = CacheState {
            lru: LruCache::new(4),
            current_index: None,
            current: None,
            prev_prefetch: None,
            next_prefetch: None,
            in_flight: HashMap::new(),
            evicted: HashSet::new(),
            hits: 0,
            misses: 0,
            active_dpi: 96.0,
        };
        state.install(page(5, QualityTier::High));
        let resident = state.install(page(5, QualityTier::Low));
        assert_eq!(resident.quality_tier, QualityTier::High);
        assert_eq!(state.lru.len(), 1);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(QualityTier::Low < QualityTier::High);
    }
}

//! The runtime half of the instrumentation.
//!
//! Instrumented code calls [`on_branch_call`] or [`on_branch_alter`] (or
//! performs the equivalent inline update against a [`TraceState`]) at every
//! branch site. Both hash the current and the previous site into the coverage
//! map:
//!
//! ```text
//!   counter mode: map[id ^ prev] += 1
//!   bitset mode:  h = id ^ prev; map[h >> 4] |= 1 << (h & 7)
//!   both:         prev = id >> 1
//! ```
//!
//! The map pointer and the previous location are process-wide. Execution
//! controllers redirect them with a [`TraceContext`]; dropping it, including
//! during unwinding, hands the probes back to the newest context still alive.

use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use once_cell::sync::Lazy;

use crate::constants::{MAP_MASK, MAP_SIZE};

/// Callback receiving `(branch_id, method_name)` for every probe hit.
///
/// It runs on the hot path of the instrumented code and must not panic: a
/// panicking observer aborts the process.
pub type Observer = Arc<dyn Fn(u32, &str) + Send + Sync>;

struct MapPtr(*mut u8);

unsafe impl Send for MapPtr {}
unsafe impl Sync for MapPtr {}

// Fallback so that probes running before any controller attaches never write
// through a null pointer.
static DEFAULT_MAP: Lazy<MapPtr> =
    Lazy::new(|| MapPtr(Box::leak(vec![0u8; MAP_SIZE].into_boxed_slice()).as_mut_ptr()));

static TRACE: TraceState = TraceState::new();
static EMBEDDED: RwLock<Vec<&'static TraceState>> = RwLock::new(Vec::new());
static OBSERVER: RwLock<Option<Observer>> = RwLock::new(None);
static OBSERVER_SET: AtomicBool = AtomicBool::new(false);

/// One coverage map pointer plus previous location register.
pub struct TraceState {
    shared_mem: AtomicPtr<u8>,
    prev_location: AtomicU32,
}

impl TraceState {
    pub const fn new() -> Self {
        Self {
            shared_mem: AtomicPtr::new(ptr::null_mut()),
            prev_location: AtomicU32::new(0),
        }
    }

    fn map(&self) -> *mut u8 {
        let map = self.shared_mem.load(Ordering::Relaxed);
        if map.is_null() { DEFAULT_MAP.0 } else { map }
    }

    /// Saturating-counter update. The byte wraps on overflow.
    #[inline]
    pub fn hit_counter(&self, id: u32) {
        let prev = self.prev_location.load(Ordering::Relaxed);
        let index = (id ^ prev) as usize & MAP_MASK;
        unsafe {
            let cell = self.map().add(index);
            *cell = (*cell).wrapping_add(1);
        }
        self.prev_location.store(id >> 1, Ordering::Relaxed);
    }

    /// Bitset update: one bit per edge instead of one byte.
    #[inline]
    pub fn hit_bitset(&self, id: u32) {
        let hash = id ^ self.prev_location.load(Ordering::Relaxed);
        let index = (hash >> 4) as usize & MAP_MASK;
        unsafe {
            *self.map().add(index) |= 1 << (hash & 7);
        }
        self.prev_location.store(id >> 1, Ordering::Relaxed);
    }

    pub fn prev_location(&self) -> u32 {
        self.prev_location.load(Ordering::Relaxed)
    }

    pub fn reset_prev_location(&self) {
        self.prev_location.store(0, Ordering::Relaxed);
    }

    fn set_map(&self, map: *mut u8) {
        self.shared_mem.store(map, Ordering::Relaxed);
    }
}

impl Default for TraceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe for the saturating-counter mode.
pub fn on_branch_call(branch_id: u32, method_name: &str) {
    TRACE.hit_counter(branch_id);
    notify(branch_id, method_name);
}

/// Probe for the bitset mode.
pub fn on_branch_alter(branch_id: u32, method_name: &str) {
    TRACE.hit_bitset(branch_id);
    notify(branch_id, method_name);
}

/// The process-wide trace state targeted by the probes above.
pub fn primary() -> &'static TraceState {
    &TRACE
}

pub fn prev_location() -> u32 {
    TRACE.prev_location()
}

/// Resets the previous location of the primary state and of every
/// registered embedded state.
pub fn reset_prev_location() {
    TRACE.reset_prev_location();
    for state in read_embedded().iter() {
        state.reset_prev_location();
    }
}

/// Registers a trace state that belongs to a separately synthesized copy of
/// the trace type (a core library carries its own).
///
/// The state is pointed at the current map right away, so registering while
/// a [`TraceContext`] is live is fine: it follows that context and every
/// later install and drop.
pub fn register_embedded(state: &'static TraceState) {
    // Same lock order as `apply`: contexts first, then the embedded list.
    let installed = installed();
    let mut embedded = EMBEDDED.write().unwrap_or_else(|e| e.into_inner());
    if !embedded.iter().any(|s| ptr::eq(*s, state)) {
        embedded.push(state);
    }
    state.set_map(current_map(&installed));
}

fn read_embedded() -> Vec<&'static TraceState> {
    EMBEDDED.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn set_observer(observer: Option<Observer>) {
    let mut slot = OBSERVER.write().unwrap_or_else(|e| e.into_inner());
    OBSERVER_SET.store(observer.is_some(), Ordering::Release);
    *slot = observer;
}

fn notify(branch_id: u32, method_name: &str) {
    if !OBSERVER_SET.load(Ordering::Acquire) {
        return;
    }
    let observer = OBSERVER.read().unwrap_or_else(|e| e.into_inner()).clone();
    if let Some(observer) = observer {
        if catch_unwind(AssertUnwindSafe(|| observer(branch_id, method_name))).is_err() {
            log::error!("Trace observer panicked at branch {branch_id} in {method_name}");
            std::process::abort();
        }
    }
}

struct Installed {
    token: u64,
    map: MapPtr,
    observer: Option<Observer>,
}

// Live contexts, oldest first. The newest one owns the probes; its observer,
// or failing that the nearest older one, receives the hits.
static INSTALLED: Mutex<Vec<Installed>> = Mutex::new(Vec::new());
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

fn installed() -> MutexGuard<'static, Vec<Installed>> {
    INSTALLED.lock().unwrap_or_else(|e| e.into_inner())
}

fn current_map(installed: &[Installed]) -> *mut u8 {
    installed.last().map_or(ptr::null_mut(), |entry| entry.map.0)
}

// Points the primary and every embedded state at the newest live map, or at
// the fallback when none is left.
fn apply(installed: &[Installed]) {
    let map = current_map(installed);
    TRACE.set_map(map);
    for state in read_embedded() {
        state.set_map(map);
    }
    let observer = installed.iter().rev().find_map(|entry| entry.observer.clone());
    set_observer(observer);
}

/// Redirects all probe writes into a caller-owned map for as long as it lives.
///
/// Contexts may be dropped in any order. Dropping one removes only its own
/// map: the newest context still alive takes over, and once none is left
/// the probes write to a private fallback map.
pub struct TraceContext<'a> {
    map: *mut u8,
    len: usize,
    token: u64,
    _map: PhantomData<&'a mut [u8]>,
}

impl<'a> TraceContext<'a> {
    /// Installs `map` as the coverage map. The observer is left untouched.
    pub fn install(map: &'a mut [u8]) -> Self {
        Self::push(map, None)
    }

    /// Installs `map` and routes every probe hit through `observer`.
    pub fn with_observer(map: &'a mut [u8], observer: Observer) -> Self {
        Self::push(map, Some(observer))
    }

    fn push(map: &'a mut [u8], observer: Option<Observer>) -> Self {
        assert!(
            map.len() == MAP_SIZE,
            "Coverage map must be exactly {MAP_SIZE} bytes"
        );
        let map = map.as_mut_ptr();
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);

        let mut installed = installed();
        installed.push(Installed {
            token,
            map: MapPtr(map),
            observer,
        });
        apply(&installed);

        Self {
            map,
            len: MAP_SIZE,
            token,
            _map: PhantomData,
        }
    }

    pub fn reset_prev_location(&self) {
        reset_prev_location();
    }

    /// Zeroes the installed map.
    pub fn clear(&self) {
        unsafe { ptr::write_bytes(self.map, 0, self.len) }
    }

    /// Copies the installed map.
    pub fn snapshot(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.map, self.len) }.to_vec()
    }
}

impl Drop for TraceContext<'_> {
    fn drop(&mut self) {
        let mut installed = installed();
        installed.retain(|entry| entry.token != self.token);
        apply(&installed);
    }
}

/// Serializes tests that touch the process-wide trace state.
#[cfg(test)]
pub(crate) fn serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

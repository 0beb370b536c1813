//! Mutator thread registration and the cooperative suspension states.
//!
//! Every thread that allocates or touches managed references registers
//! first and keeps the returned guard alive. Registration hands out a
//! control block shared with the suspension coordinator; the thread's
//! allocation context and shadow stack live there so the collector can
//! reach them while the thread is stopped.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap::alloc::AllocContext;
use crate::roots::ShadowStack;
use crate::suspend::{self, SuspendShared};

/// Thread executes mutator code freely.
pub const STATE_RUNNING: u8 = 0;
/// The coordinator asked the thread to park at its next safe point.
pub const STATE_SUSPEND_REQUESTED: u8 = 1;
/// The thread is parked; its roots and context may be examined.
pub const STATE_SUSPENDED: u8 = 2;
/// The thread is in an external (unmanaged) call region. It does not poll,
/// does not block collections, and its managed state is frozen.
pub const STATE_EXTERNAL: u8 = 3;

/// Shared control block of one registered mutator.
pub struct MutatorControl {
    pub(crate) state: AtomicU8,
    /// Set by the coordinator when this thread missed the suspension
    /// deadline; cleared on resume.
    pub(crate) exempt: AtomicBool,
    /// True while the thread is parked inside the signal handler rather
    /// than at a polling safe point.
    pub(crate) parked_in_handler: AtomicBool,
    /// Bump-allocation span. Advanced by the owner thread; snapshotted and
    /// reset by the collector while the owner is parked.
    pub(crate) ctx: AllocContext,
    pub(crate) shadow: ShadowStack,
    pub(crate) shared: Arc<SuspendShared>,
    #[cfg(unix)]
    pub(crate) os_thread: libc::pthread_t,
    /// Parked threads wait here when stopped from the signal handler;
    /// semaphores are the only async-signal-safe park.
    #[cfg(unix)]
    pub(crate) resume_sem: suspend::Semaphore,
}

// SAFETY: every field is atomic or internally synchronized; `os_thread` is
// read-only after registration.
unsafe impl Send for MutatorControl {}
unsafe impl Sync for MutatorControl {}

impl MutatorControl {
    fn new(shared: Arc<SuspendShared>) -> Self {
        Self {
            state: AtomicU8::new(STATE_RUNNING),
            exempt: AtomicBool::new(false),
            parked_in_handler: AtomicBool::new(false),
            ctx: AllocContext::default(),
            shadow: ShadowStack::new(),
            shared,
            #[cfg(unix)]
            os_thread: unsafe { libc::pthread_self() },
            #[cfg(unix)]
            resume_sem: suspend::Semaphore::new(),
        }
    }

    #[must_use]
    pub fn is_exempt(&self) -> bool {
        self.exempt.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn shadow_stack(&self) -> &ShadowStack {
        &self.shadow
    }

    #[must_use]
    pub(crate) fn alloc_ctx(&self) -> &AllocContext {
        &self.ctx
    }
}

/// All registered mutators. The coordinator holds the registry lock for the
/// whole stop-the-world window, so registration and deregistration cannot
/// straddle a collection.
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<MutatorControl>>>,
    shared: Arc<SuspendShared>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(shared: Arc<SuspendShared>) -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            shared,
        }
    }

    pub(crate) fn register(&self) -> Arc<MutatorControl> {
        let control = Arc::new(MutatorControl::new(Arc::clone(&self.shared)));
        self.threads.lock().push(Arc::clone(&control));
        control
    }

    pub(crate) fn deregister(&self, control: &Arc<MutatorControl>) {
        let mut threads = self.threads.lock();
        threads.retain(|c| !Arc::ptr_eq(c, control));
    }

    /// Locks the registry for a stop-the-world window.
    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Vec<Arc<MutatorControl>>> {
        self.threads.lock()
    }
}

thread_local! {
    /// Raw pointer to this thread's control block, readable from a signal
    /// handler. Kept alive by the thread's `MutatorGuard`.
    static CURRENT: Cell<*const MutatorControl> = const { Cell::new(ptr::null()) };
    /// Depth of runtime sections (heap entry points). The signal handler
    /// never parks a thread inside one, so a parked thread can never hold
    /// a heap lock.
    static RUNTIME_DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub(crate) fn current_control() -> Option<&'static MutatorControl> {
    let ptr = CURRENT.with(Cell::get);
    // SAFETY: CURRENT is non-null only between guard creation and drop, and
    // the guard owns an Arc keeping the control block alive.
    unsafe { ptr.as_ref() }
}

pub(crate) fn current_control_ptr() -> *const MutatorControl {
    CURRENT.try_with(Cell::get).unwrap_or(ptr::null())
}

pub(crate) fn in_runtime_section() -> bool {
    RUNTIME_DEPTH.try_with(Cell::get).unwrap_or(0) > 0
}

/// Marks a heap entry point; the signal backend defers parking while one is
/// open. Declared before any lock acquisition so it drops last.
pub(crate) struct RuntimeSection;

impl RuntimeSection {
    pub(crate) fn enter() -> Self {
        RUNTIME_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for RuntimeSection {
    fn drop(&mut self) {
        let depth = RUNTIME_DEPTH.with(|d| {
            let depth = d.get() - 1;
            d.set(depth);
            depth
        });
        if depth == 0 {
            // A suspension request deferred by this section parks here.
            safepoint();
        }
    }
}

/// Polls for a pending suspension request and parks if one is due.
///
/// Mutators call this regularly (loop back-edges, before blocking calls).
/// Cheap when no collection is pending: one relaxed load.
#[inline]
pub fn safepoint() {
    if let Some(control) = current_control() {
        if control.state.load(Ordering::Relaxed) == STATE_SUSPEND_REQUESTED {
            suspend::park_at_safepoint(control);
        }
    }
}

/// Enters an external (unmanaged) call region. The thread stops polling and
/// stops blocking collections; it must not touch managed objects until
/// [`leave_external`].
pub fn enter_external() {
    let Some(control) = current_control() else {
        return;
    };
    loop {
        match control.state.compare_exchange(
            STATE_RUNNING,
            STATE_EXTERNAL,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            // A suspension request beat us; honor it first.
            Err(_) => safepoint(),
        }
    }
}

/// Leaves an external call region, blocking first if a collection is in
/// progress.
pub fn leave_external() {
    if let Some(control) = current_control() {
        suspend::leave_external_gate(control);
    }
}

/// Registration guard for a mutator thread. Dropping it deregisters the
/// thread; any unused allocation span is handed back as heap filler.
pub struct MutatorGuard<'h> {
    heap: &'h crate::RuntimeHeap,
    control: Arc<MutatorControl>,
}

impl<'h> MutatorGuard<'h> {
    pub(crate) fn new(heap: &'h crate::RuntimeHeap, control: Arc<MutatorControl>) -> Self {
        CURRENT.with(|c| {
            assert!(c.get().is_null(), "thread is already registered");
            c.set(Arc::as_ptr(&control));
        });
        Self { heap, control }
    }

    #[must_use]
    pub fn control(&self) -> &Arc<MutatorControl> {
        &self.control
    }

    /// Opens a shadow-stack frame for this thread.
    #[must_use]
    pub fn frame(&self) -> crate::roots::ShadowFrame<'_> {
        crate::roots::ShadowFrame::new(&self.control.shadow)
    }
}

impl Drop for MutatorGuard<'_> {
    fn drop(&mut self) {
        // Make sure no collection is mid-flight while we unhook; parking
        // here also flushes a pending suspension request.
        safepoint();
        self.heap.release_thread(&self.control);
        CURRENT.with(|c| c.set(ptr::null()));
    }
}

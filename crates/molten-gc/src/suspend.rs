//! Stop-the-world suspension.
//!
//! The coordinator flips every running mutator to `SuspendRequested`, nudges
//! it through the configured backend, and waits for the pending count to
//! drain. Threads park either at a polling safe point (condvar) or inside
//! the signal handler (semaphore; the only async-signal-safe park). A thread
//! that misses the deadline is exempted: the collection proceeds without it
//! and its shadow stack is scanned conservatively.
//!
//! The coordinator polls the pending count with a short condvar timeout
//! instead of requiring parkers to signal it, because a thread parking from
//! the signal handler cannot touch a condvar.

use std::sync::atomic::{fence, AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::threads::{
    MutatorControl, STATE_RUNNING, STATE_SUSPENDED, STATE_SUSPEND_REQUESTED,
};

/// Rendezvous state shared between the coordinator and every mutator.
pub struct SuspendShared {
    /// Mutators still expected to park in the current window.
    pending: AtomicIsize,
    pending_mutex: Mutex<()>,
    pending_cv: Condvar,
    /// Poll-parked mutators wait here for resume.
    resume_mutex: Mutex<()>,
    resume_cv: Condvar,
    /// Gate for `leave_external`: true for the whole stop-the-world window.
    gc_active: Mutex<bool>,
    gate_cv: Condvar,
}

impl Default for SuspendShared {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendShared {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: AtomicIsize::new(0),
            pending_mutex: Mutex::new(()),
            pending_cv: Condvar::new(),
            resume_mutex: Mutex::new(()),
            resume_cv: Condvar::new(),
            gc_active: Mutex::new(false),
            gate_cv: Condvar::new(),
        }
    }
}

/// Parks the current thread at a polling safe point. Called with the
/// thread's state at `SuspendRequested`.
pub(crate) fn park_at_safepoint(control: &MutatorControl) {
    if control
        .state
        .compare_exchange(
            STATE_SUSPEND_REQUESTED,
            STATE_SUSPENDED,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return;
    }
    let shared = &control.shared;
    shared.pending.fetch_sub(1, Ordering::AcqRel);
    {
        let _guard = shared.pending_mutex.lock();
    }
    shared.pending_cv.notify_all();

    let mut guard = shared.resume_mutex.lock();
    while control.state.load(Ordering::Acquire) == STATE_SUSPENDED {
        shared.resume_cv.wait(&mut guard);
    }
}

/// Parks the current thread from inside the signal handler. Only
/// async-signal-safe operations: atomics and `sem_wait`.
#[cfg(unix)]
pub(crate) fn park_in_handler(control: &MutatorControl) {
    if control
        .state
        .compare_exchange(
            STATE_SUSPEND_REQUESTED,
            STATE_SUSPENDED,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return;
    }
    control.parked_in_handler.store(true, Ordering::Release);
    control.shared.pending.fetch_sub(1, Ordering::AcqRel);
    // The coordinator discovers the decrement on its next poll tick.
    while control.state.load(Ordering::Acquire) == STATE_SUSPENDED {
        control.resume_sem.wait();
    }
    control.parked_in_handler.store(false, Ordering::Release);
}

/// Completes `leave_external`: waits out any stop-the-world window, then
/// re-enters the running state.
pub(crate) fn leave_external_gate(control: &MutatorControl) {
    let shared = &control.shared;
    let mut active = shared.gc_active.lock();
    while *active {
        shared.gate_cv.wait(&mut active);
    }
    control.state.store(STATE_RUNNING, Ordering::Release);
}

/// How the coordinator nudges a thread that was asked to suspend.
pub trait SuspensionBackend: Send + Sync {
    /// Called once per target after its state is set to `SuspendRequested`.
    fn notify(&self, control: &MutatorControl);
}

/// Relies purely on mutator polling; targets park at their next safe point.
pub struct PollBackend;

impl SuspensionBackend for PollBackend {
    fn notify(&self, _control: &MutatorControl) {}
}

/// Additionally interrupts targets with a signal so threads that poll
/// rarely still stop promptly. The handler parks the thread on its
/// semaphore unless it is inside a heap entry point, in which case parking
/// is deferred to the section exit.
#[cfg(unix)]
pub struct SignalBackend;

#[cfg(unix)]
const SUSPEND_SIGNAL: libc::c_int = libc::SIGURG;

#[cfg(unix)]
impl SignalBackend {
    /// Installs the suspension signal handler (once per process).
    #[must_use]
    pub fn new() -> Self {
        static INSTALL: std::sync::Once = std::sync::Once::new();
        INSTALL.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = suspend_handler as usize;
            action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(SUSPEND_SIGNAL, &action, std::ptr::null_mut()) != 0 {
                panic!(
                    "failed to install suspension signal handler: {}",
                    std::io::Error::last_os_error()
                );
            }
        });
        Self
    }
}

#[cfg(unix)]
impl Default for SignalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl SuspensionBackend for SignalBackend {
    fn notify(&self, control: &MutatorControl) {
        // SAFETY: os_thread stays valid while the control block is
        // registered, and the coordinator holds the registry lock.
        unsafe {
            libc::pthread_kill(control.os_thread, SUSPEND_SIGNAL);
        }
    }
}

#[cfg(unix)]
extern "C" fn suspend_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    let saved_errno = errno::get();
    let ptr = crate::threads::current_control_ptr();
    if !ptr.is_null() && !crate::threads::in_runtime_section() {
        // SAFETY: the pointer is published by the thread's own guard and
        // stays valid until deregistration, which waits out collections.
        let control = unsafe { &*ptr };
        if control.state.load(Ordering::Acquire) == STATE_SUSPEND_REQUESTED {
            park_in_handler(control);
        }
    }
    errno::set(saved_errno);
}

#[cfg(unix)]
mod errno {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn location() -> *mut libc::c_int {
        unsafe { libc::__errno_location() }
    }

    #[cfg(any(target_vendor = "apple", target_os = "freebsd"))]
    unsafe fn location() -> *mut libc::c_int {
        unsafe { libc::__error() }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_vendor = "apple",
        target_os = "freebsd",
    )))]
    unsafe fn location() -> *mut libc::c_int {
        static mut FALLBACK: libc::c_int = 0;
        std::ptr::addr_of_mut!(FALLBACK)
    }

    pub(super) fn get() -> libc::c_int {
        unsafe { *location() }
    }

    pub(super) fn set(value: libc::c_int) {
        unsafe { *location() = value };
    }
}

/// A POSIX semaphore. `sem_wait`/`sem_post` are async-signal-safe, which the
/// condvar path is not. Boxed so the `sem_t` never moves after `sem_init`.
#[cfg(unix)]
pub(crate) struct Semaphore {
    inner: Box<std::cell::UnsafeCell<libc::sem_t>>,
}

#[cfg(unix)]
impl Semaphore {
    pub(crate) fn new() -> Self {
        let inner: Box<std::cell::UnsafeCell<libc::sem_t>> =
            Box::new(std::cell::UnsafeCell::new(unsafe { std::mem::zeroed() }));
        // SAFETY: the sem_t is freshly allocated and never moves.
        let rc = unsafe { libc::sem_init(inner.get(), 0, 0) };
        assert_eq!(rc, 0, "sem_init failed");
        Self { inner }
    }

    pub(crate) fn wait(&self) {
        loop {
            // SAFETY: initialized in new().
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            assert_eq!(err.raw_os_error(), Some(libc::EINTR), "sem_wait: {err}");
        }
    }

    pub(crate) fn post(&self) {
        // SAFETY: initialized in new().
        unsafe { libc::sem_post(self.inner.get()) };
    }
}

#[cfg(unix)]
impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: initialized in new(); no waiter can outlive the control
        // block that owns this semaphore.
        unsafe { libc::sem_destroy(self.inner.get()) };
    }
}

#[cfg(unix)]
unsafe impl Send for Semaphore {}
#[cfg(unix)]
unsafe impl Sync for Semaphore {}

/// Picks the platform's preferred backend.
#[must_use]
pub fn default_backend() -> Box<dyn SuspensionBackend> {
    #[cfg(unix)]
    {
        Box::new(SignalBackend::new())
    }
    #[cfg(not(unix))]
    {
        Box::new(PollBackend)
    }
}

/// Result of a suspension rendezvous.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuspendOutcome {
    /// Threads that missed the deadline and run on, conservatively scanned.
    pub exempted: usize,
}

pub(crate) struct SuspensionCoordinator {
    shared: Arc<SuspendShared>,
    backend: Box<dyn SuspensionBackend>,
}

impl SuspensionCoordinator {
    pub(crate) fn new(shared: Arc<SuspendShared>, backend: Box<dyn SuspensionBackend>) -> Self {
        Self { shared, backend }
    }

    /// Brings every registered mutator except `self_control` (the thread
    /// driving the collection) to a stop. Returns once each target is
    /// `Suspended`, `External`, or exempted by timeout.
    pub(crate) fn suspend_all(
        &self,
        threads: &[Arc<MutatorControl>],
        self_control: *const MutatorControl,
        timeout: Duration,
    ) -> SuspendOutcome {
        {
            let mut active = self.shared.gc_active.lock();
            *active = true;
        }

        // Reset stragglers left by a prior window's exemptions, then arm
        // the counter per target before its state flips: a fast thread can
        // park and decrement the instant it observes the request.
        self.shared.pending.store(0, Ordering::Release);
        let mut requested: Vec<&Arc<MutatorControl>> = Vec::new();
        for control in threads {
            if std::ptr::eq(Arc::as_ptr(control), self_control) {
                continue;
            }
            self.shared.pending.fetch_add(1, Ordering::AcqRel);
            // External threads are frozen from the managed side; leave them.
            if control
                .state
                .compare_exchange(
                    STATE_RUNNING,
                    STATE_SUSPEND_REQUESTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                requested.push(control);
            } else {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        for control in &requested {
            self.backend.notify(control);
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.pending_mutex.lock();
        while self.shared.pending.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            let _ = self
                .shared
                .pending_cv
                .wait_for(&mut guard, Duration::from_millis(1));
        }
        drop(guard);

        let mut exempted = 0;
        if self.shared.pending.load(Ordering::Acquire) > 0 {
            for control in &requested {
                if control.state.load(Ordering::Acquire) == STATE_SUSPEND_REQUESTED {
                    control.exempt.store(true, Ordering::Release);
                    exempted += 1;
                }
            }
            warn!(exempted, "mutators missed the suspension deadline");
        }
        debug!(
            stopped = requested.len() - exempted,
            exempted, "world stopped"
        );
        // Everything the stopped threads wrote is visible to the collector.
        fence(Ordering::SeqCst);
        SuspendOutcome { exempted }
    }

    /// Releases every parked mutator and reopens the external-leave gate.
    pub(crate) fn resume_all(
        &self,
        threads: &[Arc<MutatorControl>],
        self_control: *const MutatorControl,
    ) {
        fence(Ordering::SeqCst);
        for control in threads {
            if std::ptr::eq(Arc::as_ptr(control), self_control) {
                continue;
            }
            control.exempt.store(false, Ordering::Release);
            // An exempted thread may park at any moment; settle it first.
            let _ = control.state.compare_exchange(
                STATE_SUSPEND_REQUESTED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if control
                .state
                .compare_exchange(
                    STATE_SUSPENDED,
                    STATE_RUNNING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // Harmless if the thread parked on the condvar instead; a
                // stray post makes one future wait spin once.
                #[cfg(unix)]
                control.resume_sem.post();
            }
        }
        {
            let _guard = self.shared.resume_mutex.lock();
        }
        self.shared.resume_cv.notify_all();

        let mut active = self.shared.gc_active.lock();
        *active = false;
        self.shared.gate_cv.notify_all();
        debug!("world resumed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::Semaphore;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn semaphore_post_releases_a_waiter() {
        let sem = Arc::new(Semaphore::new());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(10));
        sem.post();
        waiter.join().unwrap();
    }

    #[test]
    fn semaphore_keeps_pending_posts() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();
    }
}

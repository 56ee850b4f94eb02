//! The process-wide instance and the holder that hands it out.
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crate::lock::LazyLock;

static INSTANCE: LazyLock<SharedInstance> = LazyLock::new(SharedInstance::construct);

static CONSTRUCTIONS: AtomicUsize = AtomicUsize::new(0);

/// The one object shared by the whole process.
///
/// Only [`InstanceHolder`] can build it and callers only ever get a
/// `&'static SharedInstance`, so there is no way to end up with a second one.
///
/// It cannot be copied:
///
/// ```compile_fail
/// use singleton::SharedInstance;
///
/// let copy: SharedInstance = Clone::clone(singleton::instance());
/// ```
///
/// ```compile_fail
/// use singleton::SharedInstance;
///
/// let mut slot: Option<SharedInstance> = None;
/// slot = Some(singleton::instance().clone());
/// ```
///
/// It cannot be moved out of the holder:
///
/// ```compile_fail
/// use singleton::SharedInstance;
///
/// let moved: SharedInstance = *singleton::instance();
/// ```
///
/// ```compile_fail
/// use singleton::SharedInstance;
///
/// let mut slot: Option<SharedInstance> = None;
/// slot = Some(*singleton::InstanceHolder::get_instance());
/// ```
///
/// And it cannot be built directly:
///
/// ```compile_fail
/// use singleton::SharedInstance;
///
/// let fake = SharedInstance::default();
/// ```
///
/// ```compile_fail
/// use singleton::SharedInstance;
///
/// let fake = SharedInstance {
///     constructed_on: std::thread::current().id(),
///     constructed_at: std::time::Instant::now(),
/// };
/// ```
#[derive(Debug)]
pub struct SharedInstance {
    constructed_on: ThreadId,
    constructed_at: Instant,
}

impl SharedInstance {
    fn construct() -> Self {
        let constructed_on = thread::current().id();
        log::debug!("constructing shared instance on {constructed_on:?}");
        CONSTRUCTIONS.fetch_add(1, Ordering::SeqCst);

        Self {
            constructed_on,
            constructed_at: Instant::now(),
        }
    }

    /// Identity of this instance, derived from its address
    pub fn id(&self) -> InstanceId {
        InstanceId(self as *const Self as usize)
    }

    /// Thread that won the race to build the instance
    pub fn constructed_on(&self) -> ThreadId {
        self.constructed_on
    }

    pub fn constructed_at(&self) -> Instant {
        self.constructed_at
    }
}

/// Two references are equal when they point to the same instance.
impl PartialEq for SharedInstance {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for SharedInstance {}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SharedInstance>();
};

/// Address of a [`SharedInstance`], printed in hexadecimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl serde::Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Whether the shared instance has been built yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initialized,
}

/// Lazy, thread-safe access to the [`SharedInstance`].
///
/// The instance is built by the first call to [`InstanceHolder::get_instance`],
/// whichever thread it comes from. Threads racing that first call wait for it
/// to finish and then all see the same, fully built instance. It lives in a
/// `static` and is never dropped before the process exits.
pub struct InstanceHolder {
    _private: (),
}

impl InstanceHolder {
    /// Returns the shared instance, building it on first use
    ///
    /// # Example
    ///
    /// ```
    /// use singleton::InstanceHolder;
    ///
    /// let a = InstanceHolder::get_instance();
    /// let b = InstanceHolder::get_instance();
    /// assert_eq!(a.id(), b.id());
    /// ```
    #[inline]
    pub fn get_instance() -> &'static SharedInstance {
        LazyLock::force(&INSTANCE)
    }

    /// Returns the current state without building the instance
    pub fn state() -> State {
        if INSTANCE.get().is_some() {
            State::Initialized
        } else {
            State::Uninitialized
        }
    }

    /// Number of times the instance has been built so far, either 0 or 1
    pub fn constructions() -> usize {
        CONSTRUCTIONS.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_same_instance() {
        let a = InstanceHolder::get_instance();
        let b = InstanceHolder::get_instance();

        assert!(std::ptr::eq(a, b));
        assert_eq!(a.id(), b.id());
        assert_eq!(a, b);
    }

    #[test]
    fn persists_across_calls() {
        let first = InstanceHolder::get_instance().id();

        let mut checksum = 0u64;
        for round in 0..5u64 {
            checksum = std::hint::black_box(checksum.wrapping_mul(31).wrapping_add(round));
            std::thread::yield_now();
            assert_eq!(InstanceHolder::get_instance().id(), first);
        }

        assert_eq!(crate::instance().id(), first);
    }

    #[test]
    fn built_once() {
        let _ = InstanceHolder::get_instance();
        assert_eq!(InstanceHolder::state(), State::Initialized);
        assert_eq!(InstanceHolder::constructions(), 1);
    }

    #[test]
    fn payload_is_stable() {
        let a = InstanceHolder::get_instance();
        let b = std::thread::spawn(InstanceHolder::get_instance)
            .join()
            .unwrap();

        assert_eq!(a.constructed_on(), b.constructed_on());
        assert_eq!(a.constructed_at(), b.constructed_at());
    }

    #[test]
    fn id_is_hexadecimal() {
        let id = InstanceHolder::get_instance().id();
        let rendered = id.to_string();

        assert!(rendered.starts_with("0x"));
        assert_eq!(
            usize::from_str_radix(rendered.trim_start_matches("0x"), 16).unwrap(),
            id.0
        );
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            format!("\"{rendered}\"")
        );
    }
}

//! A lazily built, thread-safe, process-wide instance.
//!
//! ```
//! let a = singleton::instance();
//! let b = std::thread::spawn(singleton::instance).join().unwrap();
//! assert_eq!(a, b);
//! ```
pub mod config;
pub mod instance;
pub mod lock;
pub mod probe;

pub use instance::{InstanceHolder, InstanceId, SharedInstance, State};

/// Returns the shared instance, see [`InstanceHolder::get_instance`]
#[inline]
pub fn instance() -> &'static SharedInstance {
    InstanceHolder::get_instance()
}

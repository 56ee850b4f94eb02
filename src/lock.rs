//! Lazily initialized cells that can live in a `static`.
use std::ops::Deref;
use std::sync::OnceLock;

use once_cell::sync::OnceCell;

/// A value computed on first access, at most once per process.
///
/// Concurrent first accesses block until the single running initializer
/// returns, and every access after that observes the fully built value.
/// If the initializer panics, the panic reaches the thread that ran it and
/// the cell stays empty, so the next access runs the initializer again.
pub struct LazyLock<T> {
    cell: OnceLock<T>,
    init: fn() -> T,
}

impl<T> LazyLock<T> {
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            cell: OnceLock::new(),
            init,
        }
    }

    /// Initializes the value if needed and returns it
    #[inline]
    pub fn force(this: &Self) -> &T {
        this.cell.get_or_init(this.init)
    }

    /// Returns the value without initializing it
    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }
}

impl<T> Deref for LazyLock<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &'_ T {
        Self::force(self)
    }
}

/// Same as [`LazyLock`] but for an initializer that can fail.
///
/// A failed attempt hands its error back to the caller that ran it and
/// leaves the cell empty. Any later caller, on any thread, may try again;
/// callers that were waiting on the failed attempt run their own.
///
/// # Example
///
/// ```
/// use singleton::lock::TryLazyLock;
///
/// static PORT: TryLazyLock<u16, std::num::ParseIntError> = TryLazyLock::new(|| "8080".parse());
///
/// assert!(PORT.get().is_none());
/// assert_eq!(PORT.force(), Ok(&8080));
/// assert_eq!(PORT.get(), Some(&8080));
/// ```
pub struct TryLazyLock<T, E> {
    cell: OnceCell<T>,
    init: fn() -> Result<T, E>,
}

impl<T, E> TryLazyLock<T, E> {
    pub const fn new(init: fn() -> Result<T, E>) -> Self {
        Self {
            cell: OnceCell::new(),
            init,
        }
    }

    /// Initializes the value if needed and returns it, or the error of this attempt
    pub fn force(&self) -> Result<&T, E> {
        self.cell.get_or_try_init(self.init)
    }

    /// Returns the value without initializing it
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }
}

//! A small object pool with scoped checkout.
//!
//! Values are borrowed through a [`Pooled`] guard. Dropping the guard resets
//! the value and returns it to the pool, so a value can never be released
//! twice and never leaks stale fields into the next request.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Types that can be cleared for reuse.
pub trait Reset {
    /// Restores the value to its empty state.
    fn reset(&mut self);
}

impl Reset for String {
    fn reset(&mut self) {
        self.clear();
    }
}

impl<T> Reset for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Pool of reusable values.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Default + Reset> Pool<T> {
    /// Creates a pool that keeps at most `max_idle` values around.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Checks a value out, creating one if the pool is empty.
    pub fn acquire(&self) -> Pooled<'_, T> {
        let value = self.idle.lock().pop().unwrap_or_default();
        Pooled {
            value: Some(value),
            pool: self,
        }
    }

    /// Number of idle values.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut value: T) {
        value.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(value);
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle.lock().len())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// Guard over a pooled value.
pub struct Pooled<'a, T: Default + Reset> {
    value: Option<T>,
    pool: &'a Pool<T>,
}

impl<T: Default + Reset> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the value.
        self.value.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Default + Reset> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Default + Reset> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

impl<T: Default + Reset + fmt::Debug> fmt::Debug for Pooled<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_resets_value() {
        let pool: Pool<String> = Pool::new(4);
        {
            let mut s = pool.acquire();
            s.push_str("stale");
        }
        assert_eq!(pool.idle(), 1);
        let s = pool.acquire();
        assert!(s.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_max_idle_bound() {
        let pool: Pool<Vec<u8>> = Pool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_concurrent_checkout() {
        let pool: std::sync::Arc<Pool<String>> = std::sync::Arc::new(Pool::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut s = pool.acquire();
                        assert!(s.is_empty());
                        s.push_str(&i.to_string());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle() <= 8);
    }
}

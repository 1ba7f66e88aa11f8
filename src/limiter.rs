//! Bounds how many report generations run at once in this process.
//!
//! The counter lives behind a single mutex so concurrent acquire/release never
//! lose updates. Limits are per process; several worker instances do not share them.

use std::sync::{Arc, Mutex};

/// Non-blocking counting limiter.
#[derive(Debug, Clone)]
pub struct GenerationLimiter {
    max: usize,
    active: Arc<Mutex<usize>>,
}

impl GenerationLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            active: Arc::new(Mutex::new(0)),
        }
    }

    /// Take a slot. Returns false instead of waiting when the cap is reached.
    pub fn try_acquire(&self) -> bool {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *active >= self.max {
            return false;
        }
        *active += 1;
        true
    }

    /// Give a slot back. Never goes below zero.
    pub fn release(&self) {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active = active.saturating_sub(1);
    }

    /// Take a slot that is released when the permit drops.
    pub fn try_permit(&self) -> Option<GenerationPermit> {
        self.try_acquire().then(|| GenerationPermit {
            limiter: self.clone(),
        })
    }

    pub fn active(&self) -> usize {
        match self.active.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_full(&self) -> bool {
        self.active() >= self.max
    }
}

/// Slot held for the lifetime of one workflow run.
#[derive(Debug)]
pub struct GenerationPermit {
    limiter: GenerationLimiter,
}

impl Drop for GenerationPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_respects_cap() {
        let limiter = GenerationLimiter::new(3);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_acquire() })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert!(limiter.is_full());

        limiter.release();
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_release_never_goes_negative() {
        let limiter = GenerationLimiter::new(1);
        limiter.release();
        limiter.release();
        assert_eq!(limiter.active(), 0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let limiter = GenerationLimiter::new(1);
        tokio_test::block_on(async {
            let permit = limiter.try_permit();
            assert!(permit.is_some());
            assert!(limiter.try_permit().is_none());
            drop(permit);
        });
        assert_eq!(limiter.active(), 0);
        assert!(limiter.try_permit().is_some());
    }
}

use std::sync::atomic::{AtomicU8, Ordering};

pub type SharedValue = AtomicU8;

/// Boolean flag shared between the GC workers and the threads driving a phase.
pub struct SharedFlag(SharedValue);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    pub fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn unset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    pub fn is_unset(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn set_cond(&self, c: bool) {
        if c {
            self.set();
        } else {
            self.unset();
        }
    }

    /// Returns true if this call flipped the flag from unset to set.
    pub fn try_set(&self) -> bool {
        if self.is_set() {
            return false;
        }

        self.0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for SharedFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Small state machine value, e.g. the GC cancellation state.
pub struct SharedEnumFlag(SharedValue);

impl SharedEnumFlag {
    pub const fn new(initial: u8) -> Self {
        Self(SharedValue::new(initial))
    }

    pub fn set(&self, val: u8) {
        self.0.store(val, Ordering::Release);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the value observed before the exchange; equal to `old` on success.
    pub fn cmpxchg(&self, old: u8, new: u8) -> u8 {
        match self
            .0
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(val) => val,
            Err(val) => val,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_flag() {
        let flag = SharedFlag::new();
        assert!(flag.is_unset());
        assert!(flag.try_set());
        assert!(!flag.try_set());
        assert!(flag.is_set());
        flag.set_cond(false);
        assert!(flag.is_unset());
    }

    #[test]
    fn test_shared_enum_flag() {
        let flag = SharedEnumFlag::new(0);
        assert_eq!(flag.cmpxchg(0, 2), 0);
        assert_eq!(flag.get(), 2);
        assert_eq!(flag.cmpxchg(0, 1), 2);
        assert_eq!(flag.get(), 2);
    }
}

//! Interned type tags.
//!
//! Headers can only hold `&'static str`, but type names for
//! [`InstrumentedAlloc::allocate_typed`] are built at runtime. Each distinct
//! name is leaked once and shared from then on, so the leaked memory is
//! bounded by the number of distinct types ever allocated.
//!
//! [`InstrumentedAlloc::allocate_typed`]: super::InstrumentedAlloc::allocate_typed

use std::sync::Mutex;

use ahash::RandomState;
use hashbrown::HashSet;

#[derive(Default)]
pub struct TagInterner {
    tags: Mutex<HashSet<&'static str, RandomState>>,
}

impl TagInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, tag: &str) -> &'static str {
        let mut tags = self
            .tags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(&interned) = tags.get(tag) {
            return interned;
        }
        let interned: &'static str = Box::leak(tag.to_owned().into_boxed_str());
        tags.insert(interned);
        interned
    }

    /// The short name of `T`, e.g. `Vec<u8>` instead of
    /// `alloc::vec::Vec<u8>`.
    pub fn type_tag<T>(&self) -> &'static str {
        self.intern(&tynm::type_name::<T>())
    }

    pub fn len(&self) -> usize {
        self.tags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

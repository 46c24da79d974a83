//! Replay protection for initial handshake blocks
//!
//! The tag checked here is the first sealed length block of a connection
//! (ciphertext plus tag). It is a function of both the salt and the derived
//! session key, so it is globally unique per legitimate new connection and
//! the check only fires after a successful authentication.
//!
//! Two bounded generations are kept and used as a ring: membership is tested
//! against both, inserts go to the current one. When the current generation
//! fills up it becomes the previous one (dropping the old previous), so the
//! window of remembered tags stays between `capacity` and `2 * capacity`.

use std::{collections::HashSet, mem};

use log::debug;

/// Tags remembered per generation when no explicit capacity is configured
pub const DEFAULT_CAPACITY: usize = 20_000;

struct TagSets {
    capacity: usize,
    current: HashSet<Box<[u8]>>,
    previous: HashSet<Box<[u8]>>,
}

impl TagSets {
    fn new(capacity: usize) -> TagSets {
        TagSets {
            capacity,
            current: HashSet::new(),
            previous: HashSet::new(),
        }
    }

    fn check_and_set(&mut self, tag: &[u8]) -> bool {
        if self.current.contains(tag) || self.previous.contains(tag) {
            return true;
        }

        if self.current.len() >= self.capacity {
            self.previous = mem::take(&mut self.current);
            debug!("replay tag set full, rotating generations (capacity {})", self.capacity);
        }

        self.current.insert(tag.into());
        false
    }
}

/// Bounded-memory set of recently observed handshake tags
pub struct ReplayProtector {
    tags: spin::Mutex<TagSets>,
    enabled: bool,
}

impl ReplayProtector {
    /// Creates a protector remembering between `capacity` and `2 * capacity`
    /// recent tags. Capacity 0 disables the check entirely.
    pub fn new(capacity: usize) -> ReplayProtector {
        ReplayProtector {
            tags: spin::Mutex::new(TagSets::new(capacity)),
            enabled: capacity > 0,
        }
    }

    /// Checks whether `tag` has been observed before, remembering it
    /// otherwise. Returns `true` iff the tag is a repeat.
    pub fn check_and_set(&self, tag: &[u8]) -> bool {
        if !self.enabled {
            return false;
        }
        self.tags.lock().check_and_set(tag)
    }
}

//! Generation-tagged session arena.
//!
//! Sessions live in a slab; every poll token carries the slot index, the
//! slot's generation at registration time, and the readiness source tag.
//! Destroying a session bumps the slot generation, so events already
//! sitting in the current batch (or timers scheduled long ago) decode to
//! a stale generation and are skipped instead of touching a freed — or
//! worse, recycled — session. This is what makes teardown safe without
//! aborting the rest of an event batch.

use mio::Token;
use slab::Slab;

use crate::Source;

const SOURCE_BITS: u32 = 2;
const INDEX_BITS: u32 = 22;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;
const GEN_SHIFT: u32 = SOURCE_BITS + INDEX_BITS;
const GEN_MASK: usize = (1 << (usize::BITS - GEN_SHIFT)) - 1;

/// A validated reference to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    index: usize,
    generation: u64,
}

impl Handle {
    /// poll token for one of this session's readiness sources
    pub fn token(&self, source: Source) -> Token {
        debug_assert!(self.index + 1 <= INDEX_MASK);
        Token(
            ((self.generation as usize & GEN_MASK) << GEN_SHIFT)
                | ((self.index + 1) << SOURCE_BITS)
                | source as usize,
        )
    }
}

/// Decode a poll token back into (slot, generation tag, source). Returns
/// `None` for tokens outside the session range (the fixed listener
/// tokens encode a zero index field).
pub fn decode_token(token: Token) -> Option<(usize, u64, Source)> {
    let index_field = (token.0 >> SOURCE_BITS) & INDEX_MASK;
    if index_field == 0 {
        return None;
    }
    let generation = (token.0 >> GEN_SHIFT) as u64;
    Some((index_field - 1, generation, Source::from_bits(token.0)))
}

#[derive(Debug)]
pub struct Registry<S> {
    slab: Slab<S>,
    generations: Vec<u64>,
    capacity: usize,
}

impl<S> Registry<S> {
    pub fn new(capacity: usize) -> Registry<S> {
        Registry {
            slab: Slab::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn at_capacity(&self) -> bool {
        self.slab.len() >= self.capacity
    }

    /// Insert a session; the constructor receives the session's own
    /// handle so it can mint poll tokens. Returns `None` at the cap, in
    /// which case the constructor is never called.
    pub fn insert_with<F: FnOnce(Handle) -> S>(&mut self, f: F) -> Option<Handle> {
        if self.at_capacity() {
            return None;
        }
        let entry = self.slab.vacant_entry();
        let index = entry.key();
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 0);
        }
        let handle = Handle {
            index,
            generation: self.generations[index],
        };
        entry.insert(f(handle));
        Some(handle)
    }

    fn is_current(&self, index: usize, generation_tag: u64) -> bool {
        self.slab.contains(index)
            && self
                .generations
                .get(index)
                .is_some_and(|g| g & GEN_MASK as u64 == generation_tag & GEN_MASK as u64)
    }

    /// Resolve a decoded token; stale generations yield `None`.
    pub fn get_mut(&mut self, index: usize, generation_tag: u64) -> Option<(Handle, &mut S)> {
        if !self.is_current(index, generation_tag) {
            return None;
        }
        let handle = Handle {
            index,
            generation: self.generations[index],
        };
        Some((handle, &mut self.slab[index]))
    }

    /// Resolve a handle we already hold (no token decoding involved).
    pub fn get_handle_mut(&mut self, handle: Handle) -> Option<&mut S> {
        if !self.is_current(handle.index, handle.generation) {
            return None;
        }
        Some(&mut self.slab[handle.index])
    }

    /// Vacate the slot and invalidate every outstanding token before the
    /// caller runs any teardown logic; a second remove with the same
    /// handle finds a stale generation and returns `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<S> {
        if !self.is_current(handle.index, handle.generation) {
            return None;
        }
        self.generations[handle.index] += 1;
        Some(self.slab.remove(handle.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let mut registry: Registry<&str> = Registry::new(4);
        let handle = registry.insert_with(|_| "a").unwrap();
        let token = handle.token(Source::Resolver);
        let (index, generation, source) = decode_token(token).unwrap();
        assert_eq!(source, Source::Resolver);
        assert!(registry.get_mut(index, generation).is_some());
    }

    #[test]
    fn listener_tokens_do_not_decode() {
        assert!(decode_token(Token(0)).is_none());
        assert!(decode_token(Token(1)).is_none());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut registry: Registry<u8> = Registry::new(2);
        registry.insert_with(|_| 1).unwrap();
        registry.insert_with(|_| 2).unwrap();
        assert_eq!(registry.len(), 2);
        // at the cap the constructor must not even run
        assert!(registry.insert_with(|_| unreachable!()).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn stale_tokens_are_skipped_after_slot_reuse() {
        let mut registry: Registry<&str> = Registry::new(2);
        let old = registry.insert_with(|_| "old").unwrap();
        let old_token = old.token(Source::Client);

        assert_eq!(registry.remove(old), Some("old"));
        let new = registry.insert_with(|_| "new").unwrap();

        // same slot, bumped generation: the old token must not resolve
        let (index, generation, _) = decode_token(old_token).unwrap();
        assert!(registry.get_mut(index, generation).is_none());

        let (index, generation, _) = decode_token(new.token(Source::Client)).unwrap();
        assert_eq!(*registry.get_mut(index, generation).unwrap().1, "new");
    }

    #[test]
    fn insert_with_hands_the_final_handle_to_the_constructor() {
        let mut registry: Registry<Token> = Registry::new(2);
        let handle = registry
            .insert_with(|handle| handle.token(Source::Timer))
            .unwrap();
        let stored = *registry.get_handle_mut(handle).unwrap();
        assert_eq!(stored, handle.token(Source::Timer));

        registry.insert_with(|h| h.token(Source::Client)).unwrap();
        assert!(registry.insert_with(|h| h.token(Source::Client)).is_none());
    }

    #[test]
    fn double_remove_is_prevented_by_construction() {
        let mut registry: Registry<u8> = Registry::new(2);
        let handle = registry.insert_with(|_| 9).unwrap();
        assert_eq!(registry.remove(handle), Some(9));
        assert_eq!(registry.remove(handle), None);
        assert!(registry.is_empty());
    }
}

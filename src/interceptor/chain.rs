//! Replayable interceptor chain cursor
//!
//! A chain is an immutable, ordered list of interceptors plus a cursor that
//! belongs to one invocation. Each interceptor receives the chain and must
//! call the chain's `process_*_next` itself to continue; not calling it
//! short-circuits the rest of the list. Every flavor (TCP, HTTP, async HTTP)
//! is this cursor instantiated with its own interceptor trait object.
//!
//! ```text
//! interceptors: [ A ][ B ][ C ]
//!                 ^
//!               cursor (advances each time an interceptor forwards)
//! ```

use std::sync::Arc;

/// Cursor over an ordered interceptor list
pub struct InterceptChain<'a, I: ?Sized> {
    interceptors: &'a [Arc<I>],
    cursor: usize,
}

impl<'a, I: ?Sized> InterceptChain<'a, I> {
    /// Start a new invocation at the head of `interceptors`
    #[must_use]
    pub const fn new(interceptors: &'a [Arc<I>]) -> Self {
        Self {
            interceptors,
            cursor: 0,
        }
    }

    /// Take the next interceptor, moving the cursor past it
    pub(crate) fn advance(&mut self) -> Option<&'a I> {
        let interceptors = self.interceptors;
        let next = interceptors.get(self.cursor)?;
        self.cursor += 1;
        Some(&**next)
    }

    /// Number of interceptors already entered by this invocation
    #[must_use]
    pub const fn position(&self) -> usize {
        self.cursor
    }

    /// Number of interceptors not yet entered
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.interceptors.len().saturating_sub(self.cursor)
    }
}

impl<I: ?Sized> std::fmt::Debug for InterceptChain<'_, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptChain")
            .field("len", &self.interceptors.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_advances_once_per_step() {
        let list: Vec<Arc<str>> = vec![Arc::from("a"), Arc::from("b")];
        let mut chain = InterceptChain::new(&list);
        assert_eq!(chain.remaining(), 2);
        assert_eq!(chain.advance(), Some("a"));
        assert_eq!(chain.position(), 1);
        assert_eq!(chain.advance(), Some("b"));
        assert_eq!(chain.advance(), None);
        assert_eq!(chain.position(), 2);
        assert_eq!(chain.remaining(), 0);
    }
}

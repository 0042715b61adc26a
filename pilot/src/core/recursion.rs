//! Scoped recursion-depth accounting for nested debugging.

use std::cell::Cell;

/// Increments a depth counter on creation and restores it on drop.
///
/// The counter is restored on every exit path, including `?` returns and
/// panics unwinding through the owning frame.
#[derive(Debug)]
pub struct RecursionGuard<'a> {
    layer: &'a Cell<u32>,
    depth: u32,
}

impl<'a> RecursionGuard<'a> {
    pub fn enter(layer: &'a Cell<u32>) -> Self {
        let depth = layer.get() + 1;
        layer.set(depth);
        Self { layer, depth }
    }

    /// Depth after entering (1 for the outermost call).
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn exceeds(&self, max: u32) -> bool {
        self.depth > max
    }
}

impl Drop for RecursionGuard<'_> {
    fn drop(&mut self) {
        self.layer.set(self.depth - 1);
    }
}

/// What a debug attempt does after the model context overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLimitAction {
    /// Rewind the branch and re-raise to the caller.
    Propagate,
    /// Rewind the branch and try the attempt loop again.
    RewindAndRetry,
}

/// Decide on the layer depth observed when the overflow was caught.
///
/// Only depth is consulted; the attempt index plays no part.
pub fn token_limit_action(layer: u32) -> TokenLimitAction {
    if layer > 0 {
        TokenLimitAction::Propagate
    } else {
        TokenLimitAction::RewindAndRetry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies nested guards unwind back to the starting depth.
    #[test]
    fn guard_restores_layer_on_drop() {
        let layer = Cell::new(0);
        {
            let outer = RecursionGuard::enter(&layer);
            assert_eq!(outer.depth(), 1);
            {
                let inner = RecursionGuard::enter(&layer);
                assert_eq!(inner.depth(), 2);
                assert!(inner.exceeds(1));
            }
            assert_eq!(layer.get(), 1);
        }
        assert_eq!(layer.get(), 0);
    }

    #[test]
    fn guard_restores_layer_on_early_return() {
        fn fails(layer: &Cell<u32>) -> Result<(), &'static str> {
            let _guard = RecursionGuard::enter(layer);
            Err::<(), _>("boom")?;
            Ok(())
        }
        let layer = Cell::new(0);
        assert!(fails(&layer).is_err());
        assert_eq!(layer.get(), 0);
    }

    #[test]
    fn only_layer_zero_retries() {
        assert_eq!(token_limit_action(0), TokenLimitAction::RewindAndRetry);
        assert_eq!(token_limit_action(1), TokenLimitAction::Propagate);
        assert_eq!(token_limit_action(3), TokenLimitAction::Propagate);
    }
}

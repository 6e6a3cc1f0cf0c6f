/// Opaque identifier handed back with every readiness event.
///
/// Each link/handler picks its own token allocation scheme (the engine uses
/// a `slab` keyed by token to recover which handler and which purpose a
/// ready file descriptor belongs to).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}

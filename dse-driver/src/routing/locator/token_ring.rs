use crate::routing::Token;

/// A sorted ring of `(token, member)` pairs. A member owns the range ending at its token.
#[derive(Debug, Clone)]
pub struct TokenRing<T> {
    ring: Vec<(Token, T)>,
}

impl<T> TokenRing<T> {
    pub(crate) const fn new_empty() -> Self {
        Self { ring: Vec::new() }
    }

    pub(crate) fn new(members: impl Iterator<Item = (Token, T)>) -> Self {
        let mut ring: Vec<(Token, T)> = members.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        Self { ring }
    }

    /// Members in token order, starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, T)> {
        self.ring.iter()
    }

    /// Walks the whole ring once, starting at the first member whose token is
    /// not lower than `token` and wrapping around after the highest one.
    pub fn ring_range_full(&self, token: Token) -> impl Iterator<Item = &(Token, T)> {
        let start = match self.ring.binary_search_by(|e| e.0.cmp(&token)) {
            Ok(exact) => exact,
            Err(first_greater) => first_greater,
        };

        self.ring[start..]
            .iter()
            .chain(self.ring.iter())
            .take(self.ring.len())
    }

    /// Like [Self::ring_range_full], without the tokens.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &T> {
        self.ring_range_full(token).map(|(_, member)| member)
    }

    /// Owner of `token`: the first member at or after it on the ring.
    pub fn owner(&self, token: Token) -> Option<&T> {
        self.ring_range(token).next()
    }

    /// Number of tokens on the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring has no tokens.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

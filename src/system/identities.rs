use std::fmt;

use log::error;

// -----------------------------------------------------------------------------
//     - Token -
// -----------------------------------------------------------------------------
/// A lightweight, copyable reference to a registered callback.
///
/// The generation makes stale tokens harmless: once a slot is freed and
/// reused, the old token no longer resolves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn to_u64(self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    pub(crate) fn from_u64(val: u64) -> Self {
        Self {
            index: val as u32,
            generation: (val >> 32) as u32,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Token({}v{})", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Identity<T> {
    Vacant { next: usize, generation: u32 },
    Occupied { generation: u32, value: T },
}

// -----------------------------------------------------------------------------
//     - Identities -
//     Slots are recycled through an intrusive free list. The highest index
//     is never handed out so `u64::MAX` stays free as a reserved token.
// -----------------------------------------------------------------------------
pub(crate) struct Identities<T> {
    inner: Vec<Identity<T>>,
    next: usize,
    len: usize,
    limit: usize,
}

impl<T> Identities<T> {
    pub(crate) fn with_capacity(capacity: usize, limit: Option<usize>) -> Self {
        let max = u32::MAX as usize - 1;
        Self {
            inner: Vec::with_capacity(capacity),
            next: 0,
            len: 0,
            limit: limit.unwrap_or(max).min(max),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    /// Store a value and hand back its token, `None` if the limit is hit.
    pub(crate) fn reserve(&mut self, value: T) -> Option<Token> {
        if self.len >= self.limit {
            return None;
        }

        let index = self.next;
        let generation = if index == self.inner.len() {
            self.inner.push(Identity::Occupied { generation: 0, value });
            self.next = self.inner.len();
            0
        } else {
            let (next, generation) = match self.inner[index] {
                Identity::Vacant { next, generation } => (next, generation),
                Identity::Occupied { .. } => panic!("tried to reserve occupied entry"),
            };
            self.inner[index] = Identity::Occupied { generation, value };
            self.next = next;
            generation
        };

        self.len += 1;
        Some(Token {
            index: index as u32,
            generation,
        })
    }

    /// Release a slot. Freeing a stale or vacant token is a no-op.
    pub(crate) fn free(&mut self, token: Token) -> Option<T> {
        let index = token.index();
        match self.inner.get(index) {
            Some(Identity::Occupied { generation, .. }) if *generation == token.generation => {}
            Some(Identity::Occupied { .. }) => return None,
            Some(Identity::Vacant { .. }) => {
                error!("tried to free a vacant entry: {:?}", token);
                return None;
            }
            None => return None,
        }

        let vacant = Identity::Vacant {
            next: self.next,
            generation: token.generation.wrapping_add(1),
        };

        self.next = index;
        self.len -= 1;

        match std::mem::replace(&mut self.inner[index], vacant) {
            Identity::Occupied { value, .. } => Some(value),
            Identity::Vacant { .. } => None,
        }
    }

    pub(crate) fn get(&self, token: Token) -> Option<&T> {
        match self.inner.get(token.index()) {
            Some(Identity::Occupied { generation, value }) if *generation == token.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        match self.inner.get_mut(token.index()) {
            Some(Identity::Occupied { generation, value }) if *generation == token.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, token: Token) -> bool {
        self.get(token).is_some()
    }
}

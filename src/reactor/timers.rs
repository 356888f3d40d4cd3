use std::collections::HashMap;
use std::time::Instant;

use crate::Token;

#[derive(Debug, Clone, Copy)]
struct Node {
    deadline: Instant,
    seq: u64,
    token: Token,
}

impl Node {
    // Ties on the deadline go to whoever registered first.
    fn before(&self, other: &Node) -> bool {
        (self.deadline, self.seq) < (other.deadline, other.seq)
    }
}

// -----------------------------------------------------------------------------
//     - TimerSet -
// -----------------------------------------------------------------------------
/// Pending timers ordered by absolute deadline.
///
/// A binary min-heap with a back index from token to heap slot, giving
/// O(log n) insert and arbitrary removal and O(1) access to the earliest
/// deadline. The set holds tokens only; the timers themselves live in the
/// reactor registry.
#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    heap: Vec<Node>,
    positions: HashMap<Token, usize>,
}

impl TimerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn contains(&self, token: Token) -> bool {
        self.positions.contains_key(&token)
    }

    /// Schedule `token`. A token already in the set is moved to the new
    /// deadline.
    pub(crate) fn insert(&mut self, token: Token, deadline: Instant, seq: u64) {
        if self.contains(token) {
            self.remove(token);
        }

        let pos = self.heap.len();
        self.heap.push(Node { deadline, seq, token });
        self.positions.insert(token, pos);
        self.sift_up(pos);
    }

    /// Take `token` out of the set, returning its deadline.
    pub(crate) fn remove(&mut self, token: Token) -> Option<Instant> {
        let pos = self.positions.remove(&token)?;
        let last = self.heap.len() - 1;

        if pos != last {
            self.heap.swap(pos, last);
            let moved = self.heap[pos].token;
            self.positions.insert(moved, pos);
        }

        let node = self.heap.pop()?;

        if pos < self.heap.len() {
            // The node swapped in can violate the heap either way.
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }

        Some(node.deadline)
    }

    pub(crate) fn peek_earliest(&self) -> Option<Instant> {
        self.heap.first().map(|n| n.deadline)
    }

    /// Remove every timer due at `now`, earliest first.
    pub(crate) fn pop_all_due(&mut self, now: Instant) -> Vec<(Token, Instant)> {
        let mut due = Vec::new();

        while let Some(node) = self.heap.first().copied() {
            if node.deadline > now {
                break;
            }
            self.remove(node.token);
            due.push((node.token, node.deadline));
        }

        due
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap[pos].before(&self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;

            if left < len && self.heap[left].before(&self.heap[smallest]) {
                smallest = left;
            }
            if right < len && self.heap[right].before(&self.heap[smallest]) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }

            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].token, a);
        self.positions.insert(self.heap[b].token, b);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::system::identities::Identities;
    use rand::seq::SliceRandom;
    use std::time::Duration;

    fn tokens(n: usize) -> Vec<Token> {
        let mut idents = Identities::with_capacity(n, None);
        (0..n).map(|i| idents.reserve(i).unwrap()).collect()
    }

    #[test]
    fn pops_in_deadline_order() {
        let base = Instant::now();
        let toks = tokens(64);

        let mut order: Vec<usize> = (0..toks.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut set = TimerSet::new();
        for (seq, i) in order.iter().enumerate() {
            set.insert(toks[*i], base + Duration::from_millis(*i as u64), seq as u64);
        }

        assert_eq!(set.peek_earliest(), Some(base));
        let due = set.pop_all_due(base + Duration::from_secs(1));
        let popped: Vec<Token> = due.iter().map(|(t, _)| *t).collect();
        assert_eq!(popped, toks);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn ties_go_to_registration_order() {
        let base = Instant::now();
        let toks = tokens(3);
        let mut set = TimerSet::new();
        set.insert(toks[2], base, 0);
        set.insert(toks[0], base, 1);
        set.insert(toks[1], base, 2);

        let popped: Vec<Token> = set.pop_all_due(base).into_iter().map(|(t, _)| t).collect();
        assert_eq!(popped, vec![toks[2], toks[0], toks[1]]);
    }

    #[test]
    fn only_due_timers_pop() {
        let base = Instant::now();
        let toks = tokens(3);
        let mut set = TimerSet::new();
        for (i, t) in toks.iter().enumerate() {
            set.insert(*t, base + Duration::from_millis(10 * i as u64), i as u64);
        }

        let due = set.pop_all_due(base + Duration::from_millis(10));
        assert_eq!(due.len(), 2);
        assert_eq!(set.len(), 1);
        assert_eq!(set.peek_earliest(), Some(base + Duration::from_millis(20)));
    }

    #[test]
    fn remove_arbitrary() {
        let base = Instant::now();
        let toks = tokens(32);
        let mut set = TimerSet::new();
        for (i, t) in toks.iter().enumerate() {
            set.insert(*t, base + Duration::from_millis((i as u64 * 7) % 32), i as u64);
        }

        for t in toks.iter().step_by(3) {
            assert!(set.remove(*t).is_some());
            assert!(set.remove(*t).is_none());
        }

        let due = set.pop_all_due(base + Duration::from_secs(1));
        assert!(due.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(due.len(), 32 - toks.iter().step_by(3).count());
    }

    #[test]
    fn reinsert_moves_the_deadline() {
        let base = Instant::now();
        let toks = tokens(2);
        let mut set = TimerSet::new();
        set.insert(toks[0], base, 0);
        set.insert(toks[1], base + Duration::from_millis(5), 1);
        set.insert(toks[0], base + Duration::from_millis(10), 0);

        assert_eq!(set.len(), 2);
        assert_eq!(set.peek_earliest(), Some(base + Duration::from_millis(5)));
    }
}

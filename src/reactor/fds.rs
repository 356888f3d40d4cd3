use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::{Interest, Token};

#[derive(Debug, Clone, Copy)]
struct Entry {
    token: Token,
    interest: Interest,
    closing: bool,
}

// -----------------------------------------------------------------------------
//     - FdTable -
//     Removal while a dispatch pass is running only marks the entry. The
//     entry goes away when the pass ends, so a handler closing its own (or
//     somebody else's) descriptor never pulls the rug from under the pass.
// -----------------------------------------------------------------------------
#[derive(Debug, Default)]
pub(crate) struct FdTable {
    entries: HashMap<RawFd, Entry>,
    deferred: Vec<RawFd>,
    in_pass: bool,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Live watches, not counting entries waiting for the end of a pass.
    pub(crate) fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.closing).count()
    }

    /// The live token watching `fd`, if any.
    pub(crate) fn owner(&self, fd: RawFd) -> Option<Token> {
        self.entries.get(&fd).filter(|e| !e.closing).map(|e| e.token)
    }

    /// Whether `token` still owns `fd`. Checked before each fd dispatch.
    pub(crate) fn is_live(&self, fd: RawFd, token: Token) -> bool {
        self.owner(fd) == Some(token)
    }

    /// Record a watch. The caller has already checked `owner(fd)` is empty;
    /// an entry still closing from this pass is replaced.
    pub(crate) fn insert(&mut self, fd: RawFd, token: Token, interest: Interest) {
        self.deferred.retain(|d| *d != fd);
        self.entries.insert(
            fd,
            Entry {
                token,
                interest,
                closing: false,
            },
        );
    }

    pub(crate) fn set_interest(&mut self, fd: RawFd, interest: Interest) {
        if let Some(entry) = self.entries.get_mut(&fd) {
            entry.interest = interest;
        }
    }

    /// Drop the watch `token` holds on `fd`.
    pub(crate) fn remove(&mut self, fd: RawFd, token: Token) {
        let in_pass = self.in_pass;
        match self.entries.get_mut(&fd) {
            Some(entry) if entry.token == token && !entry.closing => {
                if in_pass {
                    entry.closing = true;
                    self.deferred.push(fd);
                } else {
                    self.entries.remove(&fd);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn begin_pass(&mut self) {
        self.in_pass = true;
    }

    pub(crate) fn end_pass(&mut self) {
        self.in_pass = false;
        for fd in self.deferred.drain(..) {
            if let Some(entry) = self.entries.get(&fd) {
                if entry.closing {
                    self.entries.remove(&fd);
                }
            }
        }
    }

    /// Every live (descriptor, interest) pair, i.e. the watch set.
    pub(crate) fn watch_set(&self) -> Vec<(RawFd, Interest)> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.closing)
            .map(|(fd, e)| (*fd, e.interest))
            .collect()
    }
}

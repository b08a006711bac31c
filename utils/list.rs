//! Index-linked list implementation
//!
//! This module provides a doubly linked list whose nodes are indices into a
//! fixed-capacity arena rather than pointers. All link storage is allocated
//! up front, so insert, remove and move-to-front never allocate and run in
//! O(1).

use alloc::vec;
use alloc::vec::Vec;

/// Sentinel meaning "no node"
const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
    linked: bool,
}

impl Link {
    const UNLINKED: Link = Link { prev: NIL, next: NIL, linked: false };
}

/// A doubly linked list over the index range `0..capacity`
#[derive(Debug, Clone)]
pub struct IndexList {
    links: Vec<Link>,
    head: u32,
    tail: u32,
    len: usize,
}

impl IndexList {
    /// Create an empty list able to hold indices `0..capacity`
    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity < NIL as usize);
        Self {
            links: vec![Link::UNLINKED; capacity],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Highest index + 1 this list can hold
    pub fn capacity(&self) -> usize {
        self.links.len()
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// Get the length of the list
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if `index` is linked
    pub fn contains(&self, index: usize) -> bool {
        self.links.get(index).map_or(false, |l| l.linked)
    }

    /// First index in the list
    pub fn front(&self) -> Option<usize> {
        Self::opt(self.head)
    }

    /// Index following `index`, if `index` is linked and not the tail
    pub fn next(&self, index: usize) -> Option<usize> {
        match self.links.get(index) {
            Some(l) if l.linked => Self::opt(l.next),
            _ => None,
        }
    }

    /// Append `index` at the tail. Returns false if it was already linked
    /// or is out of range.
    pub fn push_back(&mut self, index: usize) -> bool {
        if !self.can_link(index) {
            return false;
        }
        let idx = index as u32;
        self.links[index] = Link { prev: self.tail, next: NIL, linked: true };
        match self.tail {
            NIL => self.head = idx,
            tail => self.links[tail as usize].next = idx,
        }
        self.tail = idx;
        self.len += 1;
        true
    }

    /// Insert `index` at the head. Returns false if it was already linked
    /// or is out of range.
    pub fn push_front(&mut self, index: usize) -> bool {
        if !self.can_link(index) {
            return false;
        }
        let idx = index as u32;
        self.links[index] = Link { prev: NIL, next: self.head, linked: true };
        match self.head {
            NIL => self.tail = idx,
            head => self.links[head as usize].prev = idx,
        }
        self.head = idx;
        self.len += 1;
        true
    }

    /// Unlink `index`. Returns false if it was not linked.
    pub fn remove(&mut self, index: usize) -> bool {
        if !self.contains(index) {
            return false;
        }
        let Link { prev, next, .. } = self.links[index];
        match prev {
            NIL => self.head = next,
            p => self.links[p as usize].next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.links[n as usize].prev = prev,
        }
        self.links[index] = Link::UNLINKED;
        self.len -= 1;
        true
    }

    /// Move `index` to the head, linking it if necessary
    pub fn move_to_front(&mut self, index: usize) {
        if self.head == index as u32 {
            return;
        }
        self.remove(index);
        self.push_front(index);
    }

    /// Unlink every node
    pub fn clear(&mut self) {
        let mut cur = self.head;
        while cur != NIL {
            let next = self.links[cur as usize].next;
            self.links[cur as usize] = Link::UNLINKED;
            cur = next;
        }
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    /// Unlink every node whose index satisfies `pred`
    pub fn remove_if(&mut self, mut pred: impl FnMut(usize) -> bool) -> usize {
        let mut removed = 0;
        let mut cur = self.front();
        while let Some(index) = cur {
            cur = self.next(index);
            if pred(index) && self.remove(index) {
                removed += 1;
            }
        }
        removed
    }

    /// Iterate indices from head to tail
    pub fn iter(&self) -> Iter<'_> {
        Iter { list: self, cur: self.head }
    }

    fn can_link(&self, index: usize) -> bool {
        index < self.links.len() && !self.links[index].linked
    }

    fn opt(raw: u32) -> Option<usize> {
        if raw == NIL {
            None
        } else {
            Some(raw as usize)
        }
    }
}

/// Head-to-tail iterator over an [`IndexList`]
pub struct Iter<'a> {
    list: &'a IndexList,
    cur: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == NIL {
            return None;
        }
        let index = self.cur as usize;
        self.cur = self.list.links[index].next;
        Some(index)
    }
}

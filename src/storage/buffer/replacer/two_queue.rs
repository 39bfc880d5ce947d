use crate::common::types::FrameId;
use super::Replacer;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Detached,
    Prefetched,
    A1,
    Am,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: u32,
    next: u32,
    queue: Queue,
}

impl Node {
    const DETACHED: Node = Node { prev: NIL, next: NIL, queue: Queue::Detached };
}

/// Head is the MRU end, tail the LRU end.
#[derive(Debug, Clone, Copy)]
struct List {
    head: u32,
    tail: u32,
    len: usize,
}

impl List {
    const EMPTY: List = List { head: NIL, tail: NIL, len: 0 };
}

/// 2Q replacement with an extra list for read-ahead frames.
///
/// Frames enter A1 on their first reference and move to AM on the second,
/// so a one-time scan only churns A1 while the working set in AM stays put.
/// Prefetched frames that were never referenced are the first victims.
///
/// The lists are intrusive: each frame owns one node in an arena indexed by
/// frame id and the links are node indices.
pub struct TwoQueueReplacer {
    nodes: Vec<Node>,
    prefetched: List,
    a1: List,
    am: List,
    a1_threshold: usize,
}

impl TwoQueueReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![Node::DETACHED; capacity],
            prefetched: List::EMPTY,
            a1: List::EMPTY,
            am: List::EMPTY,
            a1_threshold: (capacity / 10).max(1),
        }
    }

    fn node(&mut self, frame_id: FrameId) -> &mut Node {
        let index = frame_id as usize;
        if index >= self.nodes.len() {
            self.nodes.resize(index + 1, Node::DETACHED);
        }
        &mut self.nodes[index]
    }

    fn queue_of(&self, frame_id: FrameId) -> Queue {
        self.nodes
            .get(frame_id as usize)
            .map_or(Queue::Detached, |node| node.queue)
    }

    fn list_mut(&mut self, queue: Queue) -> Option<&mut List> {
        match queue {
            Queue::Detached => None,
            Queue::Prefetched => Some(&mut self.prefetched),
            Queue::A1 => Some(&mut self.a1),
            Queue::Am => Some(&mut self.am),
        }
    }

    fn list(&self, queue: Queue) -> List {
        match queue {
            Queue::Detached => List::EMPTY,
            Queue::Prefetched => self.prefetched,
            Queue::A1 => self.a1,
            Queue::Am => self.am,
        }
    }

    /// Insert a detached frame at the MRU end of `queue`
    fn push_mru(&mut self, frame_id: FrameId, queue: Queue) {
        let Some(list) = self.list_mut(queue) else { return };
        let old_head = list.head;
        list.head = frame_id;
        if old_head == NIL {
            list.tail = frame_id;
        }
        list.len += 1;

        if old_head != NIL {
            self.nodes[old_head as usize].prev = frame_id;
        }
        *self.node(frame_id) = Node { prev: NIL, next: old_head, queue };
    }

    fn unlink(&mut self, frame_id: FrameId) {
        let queue = self.queue_of(frame_id);
        if queue == Queue::Detached {
            return;
        }
        let Node { prev, next, .. } = self.nodes[frame_id as usize];
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        }
        if let Some(list) = self.list_mut(queue) {
            if list.head == frame_id {
                list.head = next;
            }
            if list.tail == frame_id {
                list.tail = prev;
            }
            list.len -= 1;
        }
        self.nodes[frame_id as usize] = Node::DETACHED;
    }

    /// Walk `queue` from its LRU end and return the first unfixed frame
    fn lru_unfixed(&self, queue: Queue, is_fixed: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut cursor = self.list(queue).tail;
        while cursor != NIL {
            if !is_fixed(cursor) {
                return Some(cursor);
            }
            cursor = self.nodes[cursor as usize].prev;
        }
        None
    }

    #[cfg(test)]
    fn members(&self, queue: Queue) -> Vec<FrameId> {
        let mut out = Vec::new();
        let mut cursor = self.list(queue).head;
        while cursor != NIL {
            out.push(cursor);
            cursor = self.nodes[cursor as usize].next;
        }
        out
    }
}

impl Replacer for TwoQueueReplacer {
    fn record_reference(&mut self, frame_id: FrameId) {
        let target = match self.queue_of(frame_id) {
            Queue::Detached | Queue::Prefetched => Queue::A1,
            Queue::A1 | Queue::Am => Queue::Am,
        };
        self.unlink(frame_id);
        self.push_mru(frame_id, target);
    }

    fn record_prefetch(&mut self, frame_id: FrameId) {
        if self.queue_of(frame_id) == Queue::Detached {
            self.push_mru(frame_id, Queue::Prefetched);
        }
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.unlink(frame_id);
    }

    fn victim(&mut self, is_fixed: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let victim = self
            .lru_unfixed(Queue::Prefetched, is_fixed)
            .or_else(|| {
                if self.a1.len > self.a1_threshold {
                    self.lru_unfixed(Queue::A1, is_fixed)
                } else {
                    None
                }
            })
            .or_else(|| self.lru_unfixed(Queue::Am, is_fixed))
            .or_else(|| self.lru_unfixed(Queue::A1, is_fixed))?;
        self.unlink(victim);
        Some(victim)
    }

    fn len(&self) -> usize {
        self.prefetched.len + self.a1.len + self.am.len
    }

    fn name(&self) -> &'static str {
        "2q"
    }
}

//! Packet queues.
//!
//! A doubly linked list stored in a slot arena. Handles stay valid while
//! their packet is queued; a stale handle (packet removed, slot reused) is
//! detected through the slot generation and yields `None`.

use crate::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    slot: usize,
    gen: u64,
}

#[derive(Debug)]
struct Node {
    pkt: Packet,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Slot {
    gen: u64,
    node: Option<Node>,
}

#[derive(Debug, Default)]
pub struct PacketQueue {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, pkt: Packet) -> usize {
        let node = Node { pkt, prev: None, next: None };
        match self.free.pop() {
            Some(slot) => {
                let s = &mut self.slots[slot];
                s.gen += 1;
                s.node = Some(node);
                slot
            }
            None => {
                self.slots.push(Slot { gen: 0, node: Some(node) });
                self.slots.len() - 1
            }
        }
    }

    fn node(&self, slot: usize) -> &Node {
        match self.slots[slot].node.as_ref() {
            Some(n) => n,
            None => unreachable!("linked slot {} is vacant", slot),
        }
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        match self.slots[slot].node.as_mut() {
            Some(n) => n,
            None => unreachable!("linked slot {} is vacant", slot),
        }
    }

    fn handle(&self, slot: usize) -> QueueHandle {
        QueueHandle { slot, gen: self.slots[slot].gen }
    }

    fn resolve(&self, h: QueueHandle) -> Option<usize> {
        let s = self.slots.get(h.slot)?;
        (s.gen == h.gen && s.node.is_some()).then_some(h.slot)
    }

    pub fn push_back(&mut self, pkt: Packet) -> QueueHandle {
        let slot = self.alloc(pkt);
        self.node_mut(slot).prev = self.tail;
        match self.tail {
            Some(t) => self.node_mut(t).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        self.handle(slot)
    }

    pub fn push_front(&mut self, pkt: Packet) -> QueueHandle {
        let slot = self.alloc(pkt);
        self.node_mut(slot).next = self.head;
        match self.head {
            Some(h) => self.node_mut(h).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        self.len += 1;
        self.handle(slot)
    }

    /// Inserts after `after`; returns `None` if the handle is stale.
    pub fn insert_after(&mut self, after: QueueHandle, pkt: Packet) -> Option<QueueHandle> {
        let prev = self.resolve(after)?;
        let next = self.node(prev).next;
        let slot = self.alloc(pkt);
        {
            let n = self.node_mut(slot);
            n.prev = Some(prev);
            n.next = next;
        }
        self.node_mut(prev).next = Some(slot);
        match next {
            Some(nx) => self.node_mut(nx).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.len += 1;
        Some(self.handle(slot))
    }

    fn unlink(&mut self, slot: usize) -> Packet {
        let node = match self.slots[slot].node.take() {
            Some(n) => n,
            None => unreachable!("linked slot {} is vacant", slot),
        };
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.node_mut(n).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(slot);
        self.len -= 1;
        node.pkt
    }

    pub fn remove(&mut self, h: QueueHandle) -> Option<Packet> {
        let slot = self.resolve(h)?;
        Some(self.unlink(slot))
    }

    pub fn pop_front(&mut self) -> Option<Packet> {
        let slot = self.head?;
        Some(self.unlink(slot))
    }

    pub fn pop_back(&mut self) -> Option<Packet> {
        let slot = self.tail?;
        Some(self.unlink(slot))
    }

    pub fn front(&self) -> Option<&Packet> {
        self.head.map(|s| &self.node(s).pkt)
    }

    pub fn front_mut(&mut self) -> Option<&mut Packet> {
        let slot = self.head?;
        Some(&mut self.node_mut(slot).pkt)
    }

    pub fn back(&self) -> Option<&Packet> {
        self.tail.map(|s| &self.node(s).pkt)
    }

    pub fn back_mut(&mut self) -> Option<&mut Packet> {
        let slot = self.tail?;
        Some(&mut self.node_mut(slot).pkt)
    }

    pub fn first_handle(&self) -> Option<QueueHandle> {
        self.head.map(|s| self.handle(s))
    }

    pub fn next_handle(&self, h: QueueHandle) -> Option<QueueHandle> {
        let slot = self.resolve(h)?;
        self.node(slot).next.map(|s| self.handle(s))
    }

    pub fn get(&self, h: QueueHandle) -> Option<&Packet> {
        self.resolve(h).map(|s| &self.node(s).pkt)
    }

    pub fn get_mut(&mut self, h: QueueHandle) -> Option<&mut Packet> {
        let slot = self.resolve(h)?;
        Some(&mut self.node_mut(slot).pkt)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { queue: self, cur: self.head }
    }

    /// Visits packets front to back; the closure returns false to stop.
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Packet) -> bool,
    {
        let mut cur = self.head;
        while let Some(slot) = cur {
            let node = self.node_mut(slot);
            if !f(&mut node.pkt) {
                break;
            }
            cur = node.next;
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }
}

pub struct Iter<'a> {
    queue: &'a PacketQueue,
    cur: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Packet;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cur?;
        let node = self.queue.node(slot);
        self.cur = node.next;
        Some(&node.pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(n: i64) -> Packet {
        Packet { pts: Some(n), ..Default::default() }
    }

    fn order(q: &PacketQueue) -> Vec<i64> {
        q.iter().filter_map(|p| p.pts).collect()
    }

    #[test]
    fn fifo_order() {
        let mut q = PacketQueue::new();
        q.push_back(pkt(1));
        q.push_back(pkt(2));
        q.push_front(pkt(0));
        assert_eq!(order(&q), vec![0, 1, 2]);
        assert_eq!(q.pop_front().and_then(|p| p.pts), Some(0));
        assert_eq!(q.pop_back().and_then(|p| p.pts), Some(2));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_middle_and_insert_after() {
        let mut q = PacketQueue::new();
        let a = q.push_back(pkt(1));
        let b = q.push_back(pkt(2));
        q.push_back(pkt(3));
        assert_eq!(q.remove(b).and_then(|p| p.pts), Some(2));
        q.insert_after(a, pkt(5)).expect("live handle");
        assert_eq!(order(&q), vec![1, 5, 3]);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let mut q = PacketQueue::new();
        let a = q.push_back(pkt(1));
        q.pop_front();
        q.push_back(pkt(9));
        assert!(q.get(a).is_none());
        assert!(q.remove(a).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn handle_walk_and_for_each_mut() {
        let mut q = PacketQueue::new();
        for i in 0..4 {
            q.push_back(pkt(i));
        }
        q.for_each_mut(|p| {
            p.dts = p.pts;
            p.pts != Some(1)
        });
        let mut h = q.first_handle();
        let mut dts = Vec::new();
        while let Some(cur) = h {
            dts.push(q.get(cur).and_then(|p| p.dts));
            h = q.next_handle(cur);
        }
        assert_eq!(dts, vec![Some(0), Some(1), None, None]);
        q.clear();
        assert!(q.is_empty());
        assert!(q.front().is_none());
    }
}

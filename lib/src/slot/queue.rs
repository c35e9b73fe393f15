use std::collections::VecDeque;

use enumn::N;

/// Named FIFOs a slot can be placed on.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum SlotQueue {
    /// Frames produced by the decoder, in decoding order.
    Output = 0,
    /// Frames to present, in display order.
    Display = 1,
    Deinterlace = 2,
    Convert = 3,
}

impl SlotQueue {
    pub const ALL: [SlotQueue; 4] = [
        SlotQueue::Output,
        SlotQueue::Display,
        SlotQueue::Deinterlace,
        SlotQueue::Convert,
    ];
}

/// The queues of a slot set. A slot is on at most one of them.
#[derive(Debug, Default)]
pub(super) struct Queues {
    lists: [VecDeque<usize>; 4],
    /// Queue each slot is on, indexed by slot.
    member_of: Vec<Option<SlotQueue>>,
}

impl Queues {
    /// Make room for slots up to `count`.
    pub(super) fn resize(&mut self, count: usize) {
        if count > self.member_of.len() {
            self.member_of.resize(count, None);
        }
    }

    pub(super) fn queue_of(&self, index: usize) -> Option<SlotQueue> {
        self.member_of.get(index).copied().flatten()
    }

    /// Take slot `index` off the queue it is on, if any.
    pub(super) fn remove(&mut self, index: usize) -> Option<SlotQueue> {
        let queue = self.member_of.get_mut(index)?.take()?;
        let list = &mut self.lists[queue as usize];
        if let Some(pos) = list.iter().position(|&i| i == index) {
            list.remove(pos);
        }

        Some(queue)
    }

    /// Append slot `index` to `queue`, taking it off any queue it was on.
    pub(super) fn push(&mut self, index: usize, queue: SlotQueue) {
        self.resize(index + 1);
        self.remove(index);
        self.lists[queue as usize].push_back(index);
        self.member_of[index] = Some(queue);
    }

    pub(super) fn front(&self, queue: SlotQueue) -> Option<usize> {
        self.lists[queue as usize].front().copied()
    }

    pub(super) fn pop(&mut self, queue: SlotQueue) -> Option<usize> {
        let index = self.lists[queue as usize].pop_front()?;
        if let Some(member) = self.member_of.get_mut(index) {
            *member = None;
        }

        Some(index)
    }

    pub(super) fn len(&self, queue: SlotQueue) -> usize {
        self.lists[queue as usize].len()
    }

    pub(super) fn iter(&self, queue: SlotQueue) -> impl Iterator<Item = &usize> {
        self.lists[queue as usize].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_membership() {
        let mut queues = Queues::default();
        queues.resize(4);

        queues.push(1, SlotQueue::Output);
        queues.push(2, SlotQueue::Output);
        queues.push(1, SlotQueue::Display);
        assert_eq!(queues.len(SlotQueue::Output), 1);
        assert_eq!(queues.front(SlotQueue::Output), Some(2));
        assert_eq!(queues.queue_of(1), Some(SlotQueue::Display));

        assert_eq!(queues.remove(1), Some(SlotQueue::Display));
        assert_eq!(queues.remove(1), None);
        assert_eq!(queues.len(SlotQueue::Display), 0);
    }

    #[test]
    fn test_fifo() {
        let mut queues = Queues::default();
        for i in [3, 0, 2, 1] {
            queues.push(i, SlotQueue::Convert);
        }
        assert_eq!(
            queues.iter(SlotQueue::Convert).copied().collect::<Vec<_>>(),
            vec![3, 0, 2, 1]
        );

        let popped: Vec<_> = std::iter::from_fn(|| queues.pop(SlotQueue::Convert)).collect();
        assert_eq!(popped, vec![3, 0, 2, 1]);
        assert_eq!(queues.queue_of(3), None);
    }
}

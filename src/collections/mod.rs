//! Bounded FIFO queues connecting the protocol layers.

use alloc::collections::VecDeque;

/// A bounded single-producer/single-consumer FIFO.
///
/// All inter-layer queues in the stack are instances of this type, sized
/// once at reset.  Enqueueing into a full queue never blocks: the item is
/// handed back and the caller decides whether that is a deferral (send
/// paths) or a counted drop (receive paths).
#[derive(Debug)]
pub struct PacketQueue<T> {
	items: VecDeque<T>,
	capacity: usize,
}

impl<T> PacketQueue<T> {
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			items: VecDeque::with_capacity(capacity),
			capacity,
		}
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn is_full(&self) -> bool {
		self.items.len() >= self.capacity
	}

	/// Free slots remaining.
	pub fn free(&self) -> usize {
		self.capacity - self.items.len()
	}

	/// Appends `item`, or returns it if the queue is full.
	pub fn enqueue(&mut self, item: T) -> Result<(), T> {
		if self.is_full() {
			return Err(item);
		}
		self.items.push_back(item);
		Ok(())
	}

	pub fn dequeue(&mut self) -> Option<T> {
		self.items.pop_front()
	}

	pub fn front(&self) -> Option<&T> {
		self.items.front()
	}

	pub fn front_mut(&mut self) -> Option<&mut T> {
		self.items.front_mut()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bounded_fifo() {
		let mut q = PacketQueue::with_capacity(2);
		assert!(q.is_empty());
		q.enqueue(1).unwrap();
		q.enqueue(2).unwrap();
		assert!(q.is_full());
		assert_eq!(q.enqueue(3), Err(3));
		assert_eq!(q.dequeue(), Some(1));
		assert_eq!(q.free(), 1);
		q.enqueue(4).unwrap();
		assert_eq!(q.dequeue(), Some(2));
		assert_eq!(q.dequeue(), Some(4));
		assert_eq!(q.dequeue(), None);
	}
}

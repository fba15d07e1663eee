//! Binary heap merger.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Head record of one of the merged inputs.
struct HeapEntry<'f, T, F> {
    item: T,
    idx: usize,
    compare: &'f F,
}

impl<'f, T, F> PartialEq for HeapEntry<'f, T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<'f, T, F> Eq for HeapEntry<'f, T, F> where F: Fn(&T, &T) -> Ordering {}

impl<'f, T, F> PartialOrd for HeapEntry<'f, T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'f, T, F> Ord for HeapEntry<'f, T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn cmp(&self, other: &Self) -> Ordering {
        // binary heap is max-heap by default so the order is reversed to get the smallest item first,
        // equal items are taken from the input with the lower index first
        (self.compare)(&other.item, &self.item).then_with(|| other.idx.cmp(&self.idx))
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// An input is dropped as soon as it is exhausted, which for chunk readers closes and deletes the chunk file
/// before the merge is over.
pub struct BinaryHeapMerger<'f, T, E, F, C>
where
    F: Fn(&T, &T) -> Ordering,
    C: IntoIterator<Item = Result<T, E>>,
{
    items: BinaryHeap<HeapEntry<'f, T, F>>,
    chunks: Vec<Option<C::IntoIter>>,
    compare: &'f F,
    initiated: bool,
}

impl<'f, T, E, F, C> BinaryHeapMerger<'f, T, E, F, C>
where
    F: Fn(&T, &T) -> Ordering,
    C: IntoIterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted according to `compare` otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    /// * `compare` - Function be be used to compare items
    pub fn new<I>(chunks: I, compare: &'f F) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|c| Some(c.into_iter())));
        let items = BinaryHeap::with_capacity(chunks.len());

        return BinaryHeapMerger {
            chunks,
            items,
            compare,
            initiated: false,
        };
    }

    /// Returns the number of inputs not exhausted yet.
    pub fn active_inputs(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.is_some()).count()
    }

    fn advance(&mut self, idx: usize) -> Result<(), E> {
        let next = match self.chunks[idx].as_mut() {
            Some(chunk) => chunk.next(),
            None => return Ok(()),
        };

        match next {
            Some(Ok(item)) => self.items.push(HeapEntry {
                item,
                idx,
                compare: self.compare,
            }),
            Some(Err(err)) => return Err(err),
            None => self.chunks[idx] = None,
        }

        return Ok(());
    }
}

impl<'f, T, E, F, C> Iterator for BinaryHeapMerger<'f, T, E, F, C>
where
    F: Fn(&T, &T) -> Ordering,
    C: IntoIterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            for idx in 0..self.chunks.len() {
                if let Err(err) = self.advance(idx) {
                    return Some(Err(err));
                }
            }
            self.initiated = true;
        }

        let entry = self.items.pop()?;
        if let Err(err) = self.advance(entry.idx) {
            return Some(Err(err));
        }

        return Some(Ok(entry.item));
    }
}

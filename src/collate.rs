//! N-way sorted merge-join of index-ordered streams
//!
//! Every input must yield items in strictly ascending [`Index`] order. The
//! collator never sorts or buffers a directory; it looks at one pending item
//! per input and fails as soon as an input goes backwards.

use crate::error::{BackstepError, Result};
use crate::index::{Index, Indexed};
use tracing::warn;

/// Checks that a stream of indexes is strictly ascending
#[derive(Debug, Default)]
pub struct AscendingValidator {
    last: Option<Index>,
}

impl AscendingValidator {
    /// Create a validator that has seen nothing yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `index` if it sorts after everything seen so far
    pub fn check(&mut self, index: &Index) -> Result<()> {
        if let Some(last) = &self.last {
            if index <= last {
                warn!("Out-of-order index {} after {}", index, last);
                return Err(BackstepError::OrderingViolation {
                    previous: last.to_string(),
                    current: index.to_string(),
                });
            }
        }
        self.last = Some(index.clone());
        Ok(())
    }
}

/// Boxed fallible stream of indexed items
pub type IndexedStream<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

struct Input<'a, T> {
    stream: IndexedStream<'a, T>,
    pending: Option<T>,
    exhausted: bool,
    validator: AscendingValidator,
}

impl<'a, T: Indexed> Input<'a, T> {
    fn fill(&mut self) -> Result<()> {
        if self.pending.is_some() || self.exhausted {
            return Ok(());
        }
        match self.stream.next() {
            Some(item) => {
                let item = item?;
                self.validator.check(item.index())?;
                self.pending = Some(item);
            }
            None => self.exhausted = true,
        }
        Ok(())
    }
}

/// Aligns several index-ordered streams
///
/// Each output tuple has one slot per input; a slot is `None` when that input
/// has nothing at the tuple's index.
pub struct Collator<'a, T> {
    inputs: Vec<Input<'a, T>>,
    failed: bool,
}

impl<'a, T: Indexed> Collator<'a, T> {
    /// Collate `streams`
    pub fn new(streams: Vec<IndexedStream<'a, T>>) -> Self {
        Collator {
            inputs: streams
                .into_iter()
                .map(|stream| Input {
                    stream,
                    pending: None,
                    exhausted: false,
                    validator: AscendingValidator::new(),
                })
                .collect(),
            failed: false,
        }
    }

    fn step(&mut self) -> Result<Option<(Index, Vec<Option<T>>)>> {
        for input in &mut self.inputs {
            input.fill()?;
        }
        let lowest = self
            .inputs
            .iter()
            .filter_map(|input| input.pending.as_ref().map(|item| item.index()))
            .min()
            .cloned();
        let Some(lowest) = lowest else {
            return Ok(None);
        };
        let slots = self
            .inputs
            .iter_mut()
            .map(|input| {
                if input.pending.as_ref().map(|item| item.index() == &lowest).unwrap_or(false) {
                    input.pending.take()
                } else {
                    None
                }
            })
            .collect();
        Ok(Some((lowest, slots)))
    }
}

impl<'a, T: Indexed> Iterator for Collator<'a, T> {
    type Item = Result<(Index, Vec<Option<T>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(Some(tuple)) => Some(Ok(tuple)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Two-way collation yielding `(index, left, right)`
pub fn collate2<'a, T: Indexed + 'a>(
    left: IndexedStream<'a, T>,
    right: IndexedStream<'a, T>,
) -> impl Iterator<Item = Result<(Index, Option<T>, Option<T>)>> + 'a {
    Collator::new(vec![left, right]).map(|tuple| {
        tuple.map(|(index, mut slots)| {
            let right = slots.pop().flatten();
            let left = slots.pop().flatten();
            (index, left, right)
        })
    })
}

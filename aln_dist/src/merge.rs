//! Full outer join of two count tables on read id.

use crate::count_table::ReadCount;
use crate::errors::{AlnDistError, Side};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Alignment counts of one read in both runs. A missing side counts as zero alignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MergedRecord {
    pub read_id: u64,
    pub old_count: u64,
    pub new_count: u64,
}

/// Peek/advance over one table, checking that read ids strictly increase.
struct OrderedCursor<I> {
    iter: I,
    side: Side,
    head: Option<ReadCount>,
}

impl<I, E> OrderedCursor<I>
where
    I: Iterator<Item = Result<ReadCount, E>>,
    E: Into<anyhow::Error>,
{
    fn new(iter: I, side: Side) -> Result<Self> {
        let mut cursor = OrderedCursor {
            iter,
            side,
            head: None,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    fn peek(&self) -> Option<&ReadCount> {
        self.head.as_ref()
    }

    /// Return the current record and load the next one.
    fn advance(&mut self) -> Result<Option<ReadCount>> {
        let next = self
            .iter
            .next()
            .transpose()
            .map_err(Into::<anyhow::Error>::into)?;
        if let (Some(prev), Some(next)) = (&self.head, &next) {
            if next.read_id <= prev.read_id {
                return Err(AlnDistError::KeyOrderingViolation {
                    side: self.side,
                    previous: prev.read_id,
                    current: next.read_id,
                }
                .into());
            }
        }
        Ok(std::mem::replace(&mut self.head, next))
    }
}

/// Lazily merges two tables iterated in ascending read id order into one ascending stream of
/// [`MergedRecord`], one per read id in either table.
///
/// Runs in time linear in the combined table sizes. The stream ends after the first error.
pub struct StreamMerger<O, N> {
    old: OrderedCursor<O>,
    new: OrderedCursor<N>,
    failed: bool,
}

impl<O, N, EO, EN> StreamMerger<O, N>
where
    O: Iterator<Item = Result<ReadCount, EO>>,
    N: Iterator<Item = Result<ReadCount, EN>>,
    EO: Into<anyhow::Error>,
    EN: Into<anyhow::Error>,
{
    pub fn new(old: O, new: N) -> Result<Self> {
        Ok(StreamMerger {
            old: OrderedCursor::new(old, Side::Old)?,
            new: OrderedCursor::new(new, Side::New)?,
            failed: false,
        })
    }

    fn step(&mut self) -> Result<Option<MergedRecord>> {
        let order = match (self.old.peek(), self.new.peek()) {
            (None, None) => return Ok(None),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(old), Some(new)) => old.read_id.cmp(&new.read_id),
        };

        let (old, new) = match order {
            Ordering::Less => (self.old.advance()?, None),
            Ordering::Greater => (None, self.new.advance()?),
            Ordering::Equal => (self.old.advance()?, self.new.advance()?),
        };
        let read_id = match (old, new) {
            (Some(c), _) | (None, Some(c)) => c.read_id,
            (None, None) => unreachable!("a peeked record is always advanced"),
        };
        Ok(Some(MergedRecord {
            read_id,
            old_count: old.map_or(0, |c| c.alignment_count),
            new_count: new.map_or(0, |c| c.alignment_count),
        }))
    }
}

impl<O, N, EO, EN> Iterator for StreamMerger<O, N>
where
    O: Iterator<Item = Result<ReadCount, EO>>,
    N: Iterator<Item = Result<ReadCount, EN>>,
    EO: Into<anyhow::Error>,
    EN: Into<anyhow::Error>,
{
    type Item = Result<MergedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.step().transpose();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn table(counts: &[(u64, u64)]) -> impl Iterator<Item = Result<ReadCount>> + '_ {
        counts.iter().map(|&(read_id, alignment_count)| {
            Ok(ReadCount {
                read_id,
                alignment_count,
            })
        })
    }

    fn merge(old: &[(u64, u64)], new: &[(u64, u64)]) -> Result<Vec<(u64, u64, u64)>> {
        StreamMerger::new(table(old), table(new))?
            .map(|r| r.map(|m| (m.read_id, m.old_count, m.new_count)))
            .collect()
    }

    #[test]
    fn test_outer_join() -> Result<()> {
        let merged = merge(&[(1, 2), (2, 1)], &[(1, 2), (2, 3), (4, 1)])?;
        assert_eq!(merged, vec![(1, 2, 2), (2, 1, 3), (4, 0, 1)]);
        Ok(())
    }

    #[test]
    fn test_one_side_empty() -> Result<()> {
        assert_eq!(merge(&[(3, 1), (8, 4)], &[])?, vec![(3, 1, 0), (8, 4, 0)]);
        assert_eq!(merge(&[], &[(0, 7)])?, vec![(0, 0, 7)]);
        assert_eq!(merge(&[], &[])?, vec![]);
        Ok(())
    }

    #[test]
    fn test_interleaved_tails() -> Result<()> {
        let merged = merge(&[(1, 1), (5, 5), (9, 9), (10, 1)], &[(2, 2), (5, 6), (11, 3)])?;
        assert_eq!(
            merged,
            vec![
                (1, 1, 0),
                (2, 0, 2),
                (5, 5, 6),
                (9, 9, 0),
                (10, 1, 0),
                (11, 0, 3)
            ]
        );
        Ok(())
    }

    #[test]
    fn test_key_ordering_violation() {
        let mut merger = StreamMerger::new(table(&[(1, 1), (4, 1), (3, 1)]), table(&[(2, 1)]))
            .unwrap();
        assert_eq!(merger.next().unwrap().unwrap().read_id, 1);
        assert_eq!(merger.next().unwrap().unwrap().read_id, 2);
        let err = merger.next().unwrap().unwrap_err();
        assert_eq!(
            err.downcast_ref::<AlnDistError>(),
            Some(&AlnDistError::KeyOrderingViolation {
                side: Side::Old,
                previous: 4,
                current: 3
            })
        );
        assert!(merger.next().is_none());
    }

    #[test]
    fn test_duplicate_key_is_a_violation() {
        let err = merge(&[(1, 1)], &[(6, 1), (6, 2)]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlnDistError>(),
            Some(AlnDistError::KeyOrderingViolation {
                side: Side::New,
                previous: 6,
                current: 6
            })
        ));
    }

    #[test]
    fn test_source_error_propagates() {
        let broken = vec![
            Ok(ReadCount {
                read_id: 1,
                alignment_count: 1,
            }),
            Err(anyhow::anyhow!("corrupt shard")),
        ];
        let merged: Result<Vec<_>> = StreamMerger::new(broken.into_iter(), table(&[(1, 1)]))
            .and_then(|m| m.collect());
        assert!(merged.is_err());
    }

    proptest! {
        #[test]
        fn prop_merge_fidelity(
            old in prop::collection::btree_map(0u64..500, 1u64..20, 0..100),
            new in prop::collection::btree_map(0u64..500, 1u64..20, 0..100),
        ) {
            let old_vec: Vec<(u64, u64)> = old.iter().map(|(&k, &v)| (k, v)).collect();
            let new_vec: Vec<(u64, u64)> = new.iter().map(|(&k, &v)| (k, v)).collect();
            let merged = merge(&old_vec, &new_vec).unwrap();

            let union: BTreeSet<u64> = old.keys().chain(new.keys()).copied().collect();
            prop_assert_eq!(merged.len(), union.len());
            prop_assert!(merged.windows(2).all(|w| w[0].0 < w[1].0));

            let by_id: BTreeMap<u64, (u64, u64)> =
                merged.iter().map(|&(id, o, n)| (id, (o, n))).collect();
            for (id, count) in &old {
                prop_assert_eq!(by_id[id].0, *count);
                if !new.contains_key(id) {
                    prop_assert_eq!(by_id[id].1, 0);
                }
            }
            for (id, count) in &new {
                prop_assert_eq!(by_id[id].1, *count);
            }
        }
    }
}

//! Planning remote move operations for a locally reordered list.
//!
//! The remote service exposes a single primitive: "move a contiguous run of
//! items so it ends up before some index". [`plan`] translates "sort this
//! list with this comparator" into a sequence of those moves, applied one
//! after another, each against the list state the previous move produced.
//!
//! The algorithm selects each element into its final position from the front
//! and is not globally minimal (a cheaper plan may exist for some inputs),
//! but it never emits an operation for an element already in place.

use std::cmp::Ordering;

/// One remote move: remove the run of `range_length` items starting at
/// `range_start`, reinsert it before the item currently at `insert_before`.
/// Indices refer to the list state before the removal of this operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderOp {
  pub range_start: usize,
  pub range_length: usize,
  pub insert_before: usize,
}

impl ReorderOp {
  /// Single-element move from `from` to before the item at `to`.
  pub fn single(from: usize, to: usize) -> Self {
    Self {
      range_start: from,
      range_length: 1,
      insert_before: to,
    }
  }
}

/// Plan the moves that sort `items` with `cmp`.
///
/// Ties are broken by original index, so equal elements keep their relative
/// order and never generate spurious moves. Lists of size 0 or 1, and lists
/// already sorted, yield an empty plan.
pub fn plan<T>(items: &[T], mut cmp: impl FnMut(&T, &T) -> Ordering) -> Vec<ReorderOp> {
  if items.len() <= 1 {
    return Vec::new();
  }

  // Target order as original indices, stably sorted.
  let mut order: Vec<usize> = (0..items.len()).collect();
  order.sort_by(|&a, &b| cmp(&items[a], &items[b]).then(a.cmp(&b)));

  let mut removed: Vec<usize> = Vec::with_capacity(items.len());
  let mut ops = Vec::new();

  for (target, &from) in order.iter().enumerate() {
    // Every element already placed whose original index was behind `from`
    // has moved to the front, shifting `from` right by one.
    let adjusted = from + removed.iter().filter(|&&r| r > from).count();
    if adjusted != target {
      ops.push(ReorderOp::single(adjusted, target));
    }
    removed.push(from);
  }

  ops
}

/// Apply one move to a list, mirroring the remote service's semantics:
/// `insert_before` is evaluated against the list before the run is removed.
pub fn apply<T>(items: &mut Vec<T>, op: &ReorderOp) {
  let end = op.range_start + op.range_length;
  debug_assert!(end <= items.len());
  debug_assert!(op.insert_before <= items.len());
  debug_assert!(op.insert_before <= op.range_start || op.insert_before >= end);

  let run: Vec<T> = items.drain(op.range_start..end).collect();
  let dest = if op.insert_before >= end {
    op.insert_before - op.range_length
  } else {
    op.insert_before
  };
  items.splice(dest..dest, run);
}

/// Apply a whole plan in order.
pub fn apply_all<T>(items: &mut Vec<T>, ops: &[ReorderOp]) {
  for op in ops {
    apply(items, op);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn planned_sort(items: &[&str]) -> (Vec<ReorderOp>, Vec<String>) {
    let owned: Vec<String> = items.iter().map(|s| s.to_string()).collect();
    let ops = plan(&owned, |a, b| a.cmp(b));
    let mut replayed = owned;
    apply_all(&mut replayed, &ops);
    (ops, replayed)
  }

  #[test]
  fn test_known_plan() {
    let (ops, replayed) = planned_sort(&["d", "b", "c", "a"]);
    // "d" lands in place without a move of its own.
    assert_eq!(
      ops,
      vec![
        ReorderOp::single(3, 0),
        ReorderOp::single(2, 1),
        ReorderOp::single(3, 2),
      ]
    );
    assert_eq!(replayed, vec!["a", "b", "c", "d"]);
  }

  #[test]
  fn test_sorted_input_yields_no_ops() {
    let (ops, _) = planned_sort(&["a", "b", "c", "d"]);
    assert!(ops.is_empty());

    let empty: Vec<i32> = Vec::new();
    assert!(plan(&empty, i32::cmp).is_empty());
    assert!(plan(&[1], i32::cmp).is_empty());
  }

  #[test]
  fn test_ties_keep_original_order() {
    let items = vec![("x", 1), ("y", 0), ("x", 2), ("y", 3)];
    let ops = plan(&items, |a, b| a.0.cmp(&b.0));
    let mut replayed = items;
    apply_all(&mut replayed, &ops);
    // Stable: the two "x" entries and the two "y" entries keep their order.
    assert_eq!(replayed, vec![("x", 1), ("x", 2), ("y", 0), ("y", 3)]);
  }

  #[test]
  fn test_descending_comparator() {
    let items = vec![1, 3, 2, 5, 4];
    let ops = plan(&items, |a, b| b.cmp(a));
    let mut replayed = items;
    apply_all(&mut replayed, &ops);
    assert_eq!(replayed, vec![5, 4, 3, 2, 1]);
  }

  #[test]
  fn test_apply_forward_move() {
    // Moving a run towards the back: insert point counted pre-removal.
    let mut items = vec!["a", "b", "c", "d", "e"];
    apply(
      &mut items,
      &ReorderOp {
        range_start: 0,
        range_length: 2,
        insert_before: 4,
      },
    );
    assert_eq!(items, vec!["c", "d", "a", "b", "e"]);
  }

  fn permutations(n: usize) -> Vec<Vec<u32>> {
    fn go(prefix: &mut Vec<u32>, rest: &mut Vec<u32>, out: &mut Vec<Vec<u32>>) {
      if rest.is_empty() {
        out.push(prefix.clone());
        return;
      }
      for i in 0..rest.len() {
        let item = rest.remove(i);
        prefix.push(item);
        go(prefix, rest, out);
        prefix.pop();
        rest.insert(i, item);
      }
    }
    let mut out = Vec::new();
    let mut rest: Vec<u32> = (0..n as u32).collect();
    go(&mut Vec::new(), &mut rest, &mut out);
    out
  }

  #[test]
  fn test_every_permutation_up_to_eight_sorts() {
    for n in 0..=8 {
      for perm in permutations(n) {
        let ops = plan(&perm, u32::cmp);
        let mut replayed = perm.clone();
        apply_all(&mut replayed, &ops);
        let mut expected = perm.clone();
        expected.sort();
        assert_eq!(replayed, expected, "permutation {:?}", perm);
        // Elements already in place never generate a move.
        assert!(ops.len() <= n.saturating_sub(1), "permutation {:?}", perm);
      }
    }
  }
}

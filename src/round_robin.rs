use crate::upstream::Upstream;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin selection which skips upstreams that are currently not alive.
///
/// The cursor is only ever touched through single atomic operations. Racing callers may interleave,
/// so fairness is best-effort as of the moment the cursor is read.
#[derive(Debug, Default)]
pub struct RoundRobin {
  cursor: AtomicUsize,
}

impl RoundRobin {
  pub fn new() -> RoundRobin {
    RoundRobin::default()
  }

  #[cfg(test)]
  pub fn starting_at(cursor: usize) -> RoundRobin {
    RoundRobin {
      cursor: AtomicUsize::new(cursor),
    }
  }

  pub fn next<'a>(&self, members: &'a [Upstream]) -> Option<&'a Upstream> {
    self.next_index(members).map(|index| &members[index])
  }

  /// Scans every member at most once, starting one past the cursor. When dead members had to be
  /// skipped the cursor jumps to the chosen member, so the following call continues from there.
  ///
  /// The cursor is kept below `members.len()`, so the rotation never breaks on integer overflow.
  pub fn next_index(&self, members: &[Upstream]) -> Option<usize> {
    let len = members.len();
    if len == 0 {
      return None;
    }

    let advance = |cursor: usize| (cursor % len + 1) % len;
    let previous = self
      .cursor
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cursor| Some(advance(cursor)))
      .unwrap_or_else(|cursor| cursor);
    let start = advance(previous);
    let index = (0..len)
      .map(|offset| (start + offset) % len)
      .find(|&index| members[index].is_alive())?;

    if index != start {
      self.cursor.store(index, Ordering::Relaxed);
    }
    Some(index)
  }
}

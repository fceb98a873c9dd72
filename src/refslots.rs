// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Physical reference-slot bookkeeping.
//!
//! Three bounded stacks track which physical slots currently hold a
//! short-term ("last"), long-term ("golden") or backward ("alt-ref")
//! picture. An index lives on at most one stack at a time. Violations of
//! the stack invariants are programming errors and fail fast.

use arrayvec::ArrayVec;

use crate::gop::FrameRole;

/// Number of physical reference slots in the pool.
pub const REF_SLOTS: usize = 8;
/// Number of logical reference kinds addressable by one frame.
pub const INTER_REFS_PER_FRAME: usize = 7;

/// Canonical reference kinds, in remapping-table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub enum RefKind {
  /// Nearest short-term reference.
  Last,
  /// Second short-term reference.
  Last2,
  /// Third short-term reference.
  Last3,
  /// Long-term reference.
  Golden,
  /// Nearest backward (future) reference.
  Bwdref,
  /// Second backward reference.
  Altref2,
  /// Farthest backward reference.
  Altref,
}

const REF_KINDS: [RefKind; INTER_REFS_PER_FRAME] = [
  RefKind::Last,
  RefKind::Last2,
  RefKind::Last3,
  RefKind::Golden,
  RefKind::Bwdref,
  RefKind::Altref2,
  RefKind::Altref,
];

/// The physical slot backing each logical reference kind at one point
/// in the coding order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub struct RefMapSnapshot {
  slots: [u8; INTER_REFS_PER_FRAME],
}

impl RefMapSnapshot {
  #[inline]
  pub fn get(self, kind: RefKind) -> u8 {
    self.slots[kind as usize]
  }
}

/// Which of the three stacks an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
  Last,
  Golden,
  Arf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefSlotStacks {
  last: ArrayVec<u8, REF_SLOTS>,
  golden: ArrayVec<u8, REF_SLOTS>,
  arf: ArrayVec<u8, REF_SLOTS>,
  assigned: [bool; REF_SLOTS],
}

impl RefSlotStacks {
  pub fn new() -> Self {
    Default::default()
  }

  fn stack(&self, kind: StackKind) -> &ArrayVec<u8, REF_SLOTS> {
    match kind {
      StackKind::Last => &self.last,
      StackKind::Golden => &self.golden,
      StackKind::Arf => &self.arf,
    }
  }

  fn stack_mut(&mut self, kind: StackKind) -> &mut ArrayVec<u8, REF_SLOTS> {
    match kind {
      StackKind::Last => &mut self.last,
      StackKind::Golden => &mut self.golden,
      StackKind::Arf => &mut self.arf,
    }
  }

  fn contains(&self, idx: u8) -> bool {
    self.last.contains(&idx)
      || self.golden.contains(&idx)
      || self.arf.contains(&idx)
  }

  /// Pushes `idx` onto a stack. The index must come from the physical
  /// pool and must not currently live on any stack.
  pub fn push(&mut self, kind: StackKind, idx: u8) {
    assert!(
      (idx as usize) < REF_SLOTS,
      "reference slot index {} outside the physical pool",
      idx
    );
    assert!(
      !self.contains(idx),
      "reference slot {} pushed while already on a stack",
      idx
    );
    self.assigned[idx as usize] = true;
    self.stack_mut(kind).push(idx);
  }

  /// Pops the most recent entry. Popping an empty stack indicates a
  /// prior bookkeeping error and aborts.
  pub fn pop(&mut self, kind: StackKind) -> u8 {
    match self.stack_mut(kind).pop() {
      Some(idx) => idx,
      None => panic!("popped an empty {:?} reference stack", kind),
    }
  }

  /// The alt-ref that the next overlay frame will redisplay, if any.
  pub fn pending_alt_ref(&self) -> Option<u8> {
    self.arf.last().copied()
  }

  fn remove_index(&mut self, idx: u8) {
    self.last.retain(|&mut v| v != idx);
    self.golden.retain(|&mut v| v != idx);
    self.arf.retain(|&mut v| v != idx);
  }

  /// Applies the stack transition for an encoded frame of the given
  /// role, refreshing physical slot `idx`.
  ///
  /// Overlay roles do not code a new picture; for those, `idx` must be
  /// the pending alt-ref slot being redisplayed.
  pub fn update(&mut self, role: FrameRole, idx: u8) {
    match role {
      FrameRole::Key => {
        // A key frame invalidates every reference.
        self.last.clear();
        self.golden.clear();
        self.arf.clear();
        self.assigned = [false; REF_SLOTS];
        self.push(StackKind::Golden, idx);
      }
      FrameRole::Golden => {
        self.remove_index(idx);
        self.push(StackKind::Golden, idx);
      }
      FrameRole::AltRef | FrameRole::IntnlAltRef => {
        self.remove_index(idx);
        self.push(StackKind::Arf, idx);
      }
      FrameRole::Overlay => {
        let shown = self.pop(StackKind::Arf);
        assert_eq!(
          shown, idx,
          "overlay must redisplay the pending alt-ref"
        );
        self.push(StackKind::Golden, shown);
      }
      FrameRole::IntnlOverlay => {
        let shown = self.pop(StackKind::Arf);
        assert_eq!(
          shown, idx,
          "overlay must redisplay the pending alt-ref"
        );
        self.push(StackKind::Last, shown);
      }
      FrameRole::Leaf => {
        self.remove_index(idx);
        self.push(StackKind::Last, idx);
      }
    }
  }

  /// Picks the physical slot the next frame of `role` should overwrite:
  /// a never-assigned slot if one exists, otherwise the oldest entry of
  /// the stack most associated with the role.
  pub fn choose_refresh_slot(&self, role: FrameRole) -> u8 {
    if let Some(free) = self.assigned.iter().position(|&a| !a) {
      return free as u8;
    }
    let preference = match role {
      FrameRole::Key | FrameRole::Golden | FrameRole::Overlay => {
        [StackKind::Golden, StackKind::Last, StackKind::Arf]
      }
      FrameRole::AltRef
      | FrameRole::IntnlAltRef
      | FrameRole::IntnlOverlay => {
        [StackKind::Arf, StackKind::Last, StackKind::Golden]
      }
      FrameRole::Leaf => {
        [StackKind::Last, StackKind::Golden, StackKind::Arf]
      }
    };
    for kind in preference {
      if let Some(&oldest) = self.stack(kind).first() {
        return oldest;
      }
    }
    panic!("no reference slot available to refresh");
  }

  /// Builds the per-kind remapping table valid at this point in the
  /// coding order. Kinds with no natural backing slot borrow the best
  /// available index that the table does not reference yet.
  pub fn snapshot_ref_map(&self) -> RefMapSnapshot {
    let mut slots: [Option<u8>; INTER_REFS_PER_FRAME] =
      [None; INTER_REFS_PER_FRAME];

    // Short-term references, most recent first.
    for (i, kind) in
      [RefKind::Last, RefKind::Last2, RefKind::Last3].iter().enumerate()
    {
      if self.last.len() > i {
        slots[*kind as usize] = Some(self.last[self.last.len() - 1 - i]);
      }
    }
    slots[RefKind::Golden as usize] = self.golden.last().copied();
    if !self.arf.is_empty() {
      let n = self.arf.len();
      // The deepest entry is the farthest look into the future.
      slots[RefKind::Altref as usize] = Some(self.arf[0]);
      slots[RefKind::Bwdref as usize] = Some(self.arf[n - 1]);
      slots[RefKind::Altref2 as usize] = Some(self.arf[(n - 1) / 2]);
    }

    let mut used: ArrayVec<u8, INTER_REFS_PER_FRAME> =
      slots.iter().flatten().copied().collect();
    for kind in REF_KINDS {
      if slots[kind as usize].is_some() {
        continue;
      }
      let borrowed = (0..REF_SLOTS as u8)
        .find(|&i| self.assigned[i as usize] && !used.contains(&i))
        .or_else(|| slots[RefKind::Last as usize])
        .unwrap_or(0);
      if !used.contains(&borrowed) && used.len() < used.capacity() {
        used.push(borrowed);
      }
      slots[kind as usize] = Some(borrowed);
    }

    let mut map = RefMapSnapshot::default();
    for kind in REF_KINDS {
      map.slots[kind as usize] = slots[kind as usize].unwrap_or(0);
    }
    map
  }
}

// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Group-of-pictures planning: frame roles, the per-group plan, and the
//! recursive pyramid structure builder.

use std::fmt;

use crate::refslots::{RefMapSnapshot, RefSlotStacks};

/// Deepest pyramid layer the builder will ever produce.
pub const MAX_PYRAMID_DEPTH: u8 = 6;

/// Shortest interval that can host a whole-group alt-ref.
pub(crate) const MIN_ALTREF_INTERVAL: u64 = 4;

/// The role a coded frame plays within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub enum FrameRole {
  /// Intra-only group anchor; invalidates all references.
  Key,
  /// Ordinary leaf frame at the bottom of the pyramid.
  Leaf,
  /// Long-term reference anchoring a group without a key frame.
  Golden,
  /// Hidden frame coded out of display order for the whole group.
  AltRef,
  /// Hidden mid-group reference for one half of the pyramid.
  IntnlAltRef,
  /// Redisplay of the group alt-ref; codes no new pixels.
  Overlay,
  /// Redisplay of an internal alt-ref; codes no new pixels.
  IntnlOverlay,
}

impl FrameRole {
  /// Whether a frame of this role is displayed at its slot position.
  #[inline]
  pub fn is_shown(self) -> bool {
    !matches!(self, FrameRole::AltRef | FrameRole::IntnlAltRef)
  }

  /// Whether this role redisplays an already-coded picture.
  #[inline]
  pub fn is_overlay(self) -> bool {
    matches!(self, FrameRole::Overlay | FrameRole::IntnlOverlay)
  }

  /// Whether this role may anchor a group at slot 0.
  #[inline]
  pub fn is_anchor(self) -> bool {
    matches!(
      self,
      FrameRole::Key | FrameRole::Golden | FrameRole::Overlay
    )
  }
}

impl fmt::Display for FrameRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::FrameRole::*;
    match self {
      Key => write!(f, "Key frame"),
      Leaf => write!(f, "Inter frame"),
      Golden => write!(f, "Golden frame"),
      AltRef => write!(f, "Alt-ref frame"),
      IntnlAltRef => write!(f, "Internal alt-ref frame"),
      Overlay => write!(f, "Overlay frame"),
      IntnlOverlay => write!(f, "Internal overlay frame"),
    }
  }
}

/// One frame to be coded within a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GopSlot {
  pub role: FrameRole,
  /// Display-order offset from the group anchor.
  pub disp_offset: u64,
  /// Depth in the coding pyramid; 0 is the root.
  pub layer_depth: u8,
  /// Boost score assigned to this slot.
  pub boost: i32,
  /// Bit budget assigned to this slot.
  pub target_bits: i64,
  /// Reference remapping table valid when this slot is coded.
  pub ref_map: RefMapSnapshot,
  /// Physical slot this frame refreshes.
  pub refresh_slot: u8,
  /// Quantizer index, filled in lazily at encode time.
  pub qindex: Option<u8>,
}

/// The published plan for one group, consumed slot by slot in coding
/// order. The final slot is a sentinel priming the next group's
/// reference map; it is never allocated bits.
#[derive(Debug, Clone, PartialEq)]
pub struct GopPlan {
  pub slots: Vec<GopSlot>,
  /// Number of displayed source frames the group covers.
  pub interval: u64,
  pub has_alt_ref: bool,
  /// Boost of the group root (alt-ref, or the anchor itself).
  pub base_boost: i32,
  /// Total bit budget the group was planned against.
  pub total_bits: i64,
}

impl GopPlan {
  /// Slots that actually get coded, excluding the trailing sentinel.
  pub fn coded_len(&self) -> usize {
    self.slots.len() - 1
  }

  pub(crate) fn sentinel(&self) -> &GopSlot {
    self.slots.last().expect("plan always carries a sentinel slot")
  }
}

// Splits the open display range [start, end) into an internal alt-ref
//  at the midpoint plus two recursed halves. Short ranges and ranges
//  past the depth bound degrade to plain leaves.
fn set_multi_layer(
  slots: &mut Vec<GopSlot>, start: u64, end: u64, depth: u8, max_depth: u8,
) {
  if end <= start {
    return;
  }
  if end - start < 3 || depth >= max_depth {
    for disp in start..end {
      slots.push(GopSlot {
        role: FrameRole::Leaf,
        disp_offset: disp,
        layer_depth: max_depth,
        boost: 0,
        target_bits: 0,
        ref_map: Default::default(),
        refresh_slot: 0,
        qindex: None,
      });
    }
    return;
  }
  let mid = (start + end) / 2;
  slots.push(GopSlot {
    role: FrameRole::IntnlAltRef,
    disp_offset: mid,
    layer_depth: depth,
    boost: 0,
    target_bits: 0,
    ref_map: Default::default(),
    refresh_slot: 0,
    qindex: None,
  });
  set_multi_layer(slots, start, mid, depth + 1, max_depth);
  slots.push(GopSlot {
    role: FrameRole::IntnlOverlay,
    disp_offset: mid,
    layer_depth: depth,
    boost: 0,
    target_bits: 0,
    ref_map: Default::default(),
    refresh_slot: 0,
    qindex: None,
  });
  set_multi_layer(slots, mid + 1, end, depth + 1, max_depth);
}

/// Builds the coding-order slot sequence for one group.
///
/// `interval` counts displayed source frames; the anchor displays
/// offset 0. When an alt-ref is in use it references display offset
/// `interval` (the next group's anchor position) and the pyramid covers
/// the open range in between. The sentinel slot carries the reference
/// state the next group starts from.
///
/// Reference maps are simulated against a scratch copy of the current
/// slot stacks so later planning stages can run before any frame has
/// actually been encoded.
pub(crate) fn build_gop_plan(
  anchor_role: FrameRole, next_anchor_role: FrameRole, interval: u64,
  use_alt_ref: bool, max_depth: u8, stacks: &RefSlotStacks,
) -> GopPlan {
  assert!(interval >= 1, "a group must cover at least one frame");
  assert!(anchor_role.is_anchor(), "slot 0 must be an anchor role");

  let mut slots = Vec::with_capacity(interval as usize + 4);
  slots.push(GopSlot {
    role: anchor_role,
    disp_offset: 0,
    layer_depth: 0,
    boost: 0,
    target_bits: 0,
    ref_map: Default::default(),
    refresh_slot: 0,
    qindex: None,
  });

  let has_alt_ref =
    use_alt_ref && interval >= MIN_ALTREF_INTERVAL && max_depth >= 1;
  if has_alt_ref {
    slots.push(GopSlot {
      role: FrameRole::AltRef,
      disp_offset: interval,
      layer_depth: 1,
      boost: 0,
      target_bits: 0,
      ref_map: Default::default(),
      refresh_slot: 0,
      qindex: None,
    });
    set_multi_layer(&mut slots, 1, interval, 2, max_depth);
  } else {
    set_multi_layer(&mut slots, 1, interval, 1, max_depth);
  }

  // Trailing sentinel: display position of the next anchor.
  slots.push(GopSlot {
    role: next_anchor_role,
    disp_offset: interval,
    layer_depth: 0,
    boost: 0,
    target_bits: 0,
    ref_map: Default::default(),
    refresh_slot: 0,
    qindex: None,
  });

  let mut sim = stacks.clone();
  for slot in &mut slots {
    let refresh = if slot.role.is_overlay() {
      sim
        .pending_alt_ref()
        .expect("overlay slot with no pending alt-ref")
    } else {
      sim.choose_refresh_slot(slot.role)
    };
    slot.ref_map = sim.snapshot_ref_map();
    slot.refresh_slot = refresh;
    sim.update(slot.role, refresh);
  }

  GopPlan { slots, interval, has_alt_ref, base_boost: 0, total_bits: 0 }
}

#[cfg(test)]
mod test {
  use super::*;

  fn plan(interval: u64, use_alt_ref: bool, max_depth: u8) -> GopPlan {
    let mut stacks = RefSlotStacks::new();
    stacks.update(FrameRole::Key, 0);
    build_gop_plan(
      FrameRole::Golden,
      FrameRole::Golden,
      interval,
      use_alt_ref,
      max_depth,
      &stacks,
    )
  }

  #[test]
  fn single_frame_group_has_no_pyramid() {
    let p = plan(1, true, 4);
    assert_eq!(p.coded_len(), 1);
    assert!(!p.has_alt_ref);
    assert_eq!(p.slots[0].layer_depth, 0);
    assert!(p.slots.iter().all(|s| s.role != FrameRole::AltRef));
  }

  #[test]
  fn alt_ref_references_next_anchor_position() {
    let p = plan(8, true, 4);
    assert!(p.has_alt_ref);
    assert_eq!(p.slots[1].role, FrameRole::AltRef);
    assert_eq!(p.slots[1].disp_offset, 8);
    assert_eq!(p.slots[1].layer_depth, 1);
  }

  #[test]
  fn every_internal_alt_ref_has_one_matching_overlay() {
    let p = plan(16, true, 4);
    for (i, slot) in p.slots.iter().enumerate() {
      if slot.role != FrameRole::IntnlAltRef {
        continue;
      }
      let overlays: Vec<_> = p.slots[i + 1..]
        .iter()
        .filter(|s| {
          s.role == FrameRole::IntnlOverlay
            && s.disp_offset == slot.disp_offset
        })
        .collect();
      assert_eq!(overlays.len(), 1);
      assert_eq!(overlays[0].layer_depth, slot.layer_depth);
    }
  }

  #[test]
  fn layer_depths_increase_toward_leaves() {
    let p = plan(16, true, 5);
    for slot in &p.slots {
      match slot.role {
        FrameRole::Key | FrameRole::Golden | FrameRole::Overlay => {
          assert_eq!(slot.layer_depth, 0);
        }
        FrameRole::AltRef => assert_eq!(slot.layer_depth, 1),
        FrameRole::IntnlAltRef | FrameRole::IntnlOverlay => {
          assert!(slot.layer_depth >= 2);
          assert!(slot.layer_depth < 5);
        }
        FrameRole::Leaf => assert_eq!(slot.layer_depth, 5),
      }
    }
  }

  #[test]
  fn shown_slots_cover_each_display_position_once() {
    for interval in [1u64, 2, 3, 5, 8, 13, 16] {
      let p = plan(interval, true, 4);
      let mut shown: Vec<u64> = p.slots[..p.coded_len()]
        .iter()
        .filter(|s| s.role.is_shown())
        .map(|s| s.disp_offset)
        .collect();
      shown.sort_unstable();
      let expected: Vec<u64> = (0..interval).collect();
      assert_eq!(shown, expected, "interval {}", interval);
    }
  }

  #[test]
  fn depth_bound_degrades_to_leaves() {
    let p = plan(16, true, 2);
    assert!(p.has_alt_ref);
    // Nothing deeper than the alt-ref layer may be a reference.
    assert!(
      p.slots.iter().all(|s| s.role != FrameRole::IntnlAltRef)
    );
    let leaves =
      p.slots.iter().filter(|s| s.role == FrameRole::Leaf).count();
    assert_eq!(leaves, 15);
  }

  #[test]
  fn sentinel_is_last_and_unfunded() {
    let p = plan(8, true, 4);
    let sentinel = p.sentinel();
    assert_eq!(sentinel.disp_offset, 8);
    assert_eq!(sentinel.target_bits, 0);
  }

  #[test]
  fn no_alt_ref_yields_flat_leaf_run() {
    let p = plan(6, false, 1);
    assert!(!p.has_alt_ref);
    let leaves =
      p.slots.iter().filter(|s| s.role == FrameRole::Leaf).count();
    assert_eq!(leaves, 5);
  }
}

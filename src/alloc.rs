// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Conversion of boost scores and a group bit budget into per-slot bit
//! targets.

use crate::gop::{FrameRole, GopPlan};
use crate::util::clamp;

/// Share of `total_bits` awarded to a frame with the given boost, with
/// the rest of the group modeled as `frame_count` frames of 100 boost
/// units each.
///
/// Boost and the chunk denominator are halved together while the boost
/// exceeds 1023 to keep the multiply inside a fixed-width range. The
/// halving is kept explicit even though the arithmetic below is 64-bit.
pub(crate) fn boost_bits(
  frame_count: i32, boost: i32, total_bits: i64,
) -> i64 {
  if boost <= 0 || total_bits <= 0 {
    return 0;
  }
  let mut boost = i64::from(boost);
  let mut allocation_chunks = 100 * i64::from(frame_count.max(0)) + boost;
  while boost > 1023 {
    boost /= 2;
    allocation_chunks /= 2;
  }
  (boost * total_bits / allocation_chunks).max(0)
}

/// Distributes `total_group_bits` across the slots of `plan`.
///
/// The group root (the alt-ref, or the anchor when there is none) is
/// funded first from its boost, then each internal alt-ref layer from
/// the second-deepest upward, then whatever remains is split evenly
/// across the leaves. Overlay slots and the sentinel always receive 0.
///
/// A zero or negative budget degrades to all-zero targets.
pub(crate) fn allocate_gop_bits(
  plan: &mut GopPlan, total_group_bits: i64, max_frame_bits: i64,
  is_key_group: bool,
) {
  let total_group_bits = total_group_bits.max(0);
  let max_frame_bits = max_frame_bits.max(0);
  let mut remaining = total_group_bits;

  let coded = plan.coded_len();

  // Step 1: the group root's own allocation. Key-frame bits are
  //  reserved by the key-frame scanner, not here.
  let root_idx = plan.slots[..coded]
    .iter()
    .position(|s| s.role == FrameRole::AltRef)
    .or_else(|| {
      plan.slots[..coded]
        .iter()
        .position(|s| s.role == FrameRole::Golden)
    });

  // A golden anchor that is not itself the root codes like a leaf and
  //  takes a leaf share.
  let normal_frames = plan.slots[..coded]
    .iter()
    .enumerate()
    .filter(|(i, s)| {
      s.role == FrameRole::Leaf
        || (s.role == FrameRole::Golden && Some(*i) != root_idx)
    })
    .count() as i32;
  if !is_key_group {
    if let Some(idx) = root_idx {
      let root_bits = boost_bits(
        plan.interval as i32,
        plan.base_boost,
        total_group_bits,
      )
      .min(max_frame_bits);
      plan.slots[idx].target_bits = root_bits;
      plan.slots[idx].boost = plan.base_boost;
      remaining -= root_bits;
    }
  }

  // Step 2: aggregate share of each internal alt-ref layer, walking
  //  from the second-deepest layer upward.
  let mut arf_layers: Vec<u8> = plan.slots[..coded]
    .iter()
    .filter(|s| s.role == FrameRole::IntnlAltRef)
    .map(|s| s.layer_depth)
    .collect();
  arf_layers.sort_unstable();
  arf_layers.dedup();

  let total_specials: i32 = plan.slots[..coded]
    .iter()
    .filter(|s| s.role == FrameRole::IntnlAltRef)
    .count() as i32;
  let mut counted_specials = 0i32;
  let mut layer_bits: Vec<(u8, i64, i32)> = Vec::new();
  for &layer in arf_layers.iter().rev() {
    let layer_boost: i32 = plan.slots[..coded]
      .iter()
      .filter(|s| {
        s.role == FrameRole::IntnlAltRef && s.layer_depth == layer
      })
      .map(|s| s.boost)
      .sum();
    let layer_count = plan.slots[..coded]
      .iter()
      .filter(|s| {
        s.role == FrameRole::IntnlAltRef && s.layer_depth == layer
      })
      .count() as i32;
    let frame_count =
      normal_frames + total_specials - counted_specials;
    let bits = boost_bits(frame_count, layer_boost, remaining);
    remaining -= bits;
    counted_specials += layer_count;
    layer_bits.push((layer, bits, layer_boost));
  }

  // Step 3: the leaves split what is left evenly.
  let leaf_bits = if normal_frames > 0 {
    clamp(remaining / i64::from(normal_frames), 0, max_frame_bits)
  } else {
    0
  };

  // Step 4: write out per-slot targets.
  for (i, slot) in plan.slots.iter_mut().enumerate() {
    if Some(i) == root_idx && !is_key_group {
      continue;
    }
    slot.target_bits = match slot.role {
      FrameRole::Key => slot.target_bits,
      FrameRole::Leaf => leaf_bits,
      FrameRole::IntnlAltRef => {
        let (_, bits, layer_boost) = *layer_bits
          .iter()
          .find(|(layer, _, _)| *layer == slot.layer_depth)
          .expect("internal alt-ref outside any accounted layer");
        if layer_boost > 0 {
          let share =
            bits * i64::from(slot.boost) / i64::from(layer_boost);
          clamp(share, 0, max_frame_bits)
        } else {
          0
        }
      }
      // Overlays redisplay an already-coded picture; the golden
      //  anchor of an alt-ref group codes like a leaf.
      FrameRole::Golden => leaf_bits,
      FrameRole::AltRef
      | FrameRole::Overlay
      | FrameRole::IntnlOverlay => 0,
    };
  }
  // The sentinel never spends bits, so a partially consumed group
  //  cannot leak budget into its successor.
  let sentinel = plan.slots.last_mut().unwrap();
  sentinel.target_bits = 0;
}

// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Decay-weighted boost estimation for key frames, golden frames and
//! alt-refs.
//!
//! A "boost" is the planner's estimate of how much extra bit budget a
//! special frame deserves, derived from how quickly prediction quality
//! decays over the frames it will serve as a reference for.

use crate::firstpass::{FirstPassStats, StatsQueue};
use crate::util::safe_divisor;

/// Smallest combined boost an alt-ref window may report.
pub const MIN_ARF_BOOST: i32 = 240;
/// Per-frame boost floor tied to the window length.
const MIN_BOOST_PER_FRAME: i32 = 50;
/// Baseline error per macroblock used as the boost numerator.
const BASELINE_ERR_PER_MB: f64 = 500.0;
/// Ceiling for a single frame's boost contribution.
pub(crate) const MAX_FRAME_BOOST: f64 = 768.0;

// Second-reference usage above this floor marks a flash candidate.
const FLASH_SR_FLOOR: f64 = 0.5;

// Prediction decay tuning. The decay accumulator is multiplicative, so
//  each per-frame rate is floored to keep one outlier frame from wiping
//  out the whole window.
const LOW_SR_DIFF_THRESH: f64 = 0.01;
const SR_DIFF_MAX: f64 = 128.0;
const SR_DIFF_PART: f64 = 0.0015;
const MOTION_AMP_PART: f64 = 0.003;
const INTRA_PART: f64 = 0.005;
const DEFAULT_DECAY_LIMIT: f64 = 0.75;
const MIN_DECAY_FACTOR: f64 = 0.1;
const ZM_POWER_FACTOR: f64 = 0.75;

/// Flash detection: a frame is a flash if the frame *after* it predicts
/// better from the frame before the flash (its second reference) than
/// from the flash itself.
pub(crate) fn detect_flash(queue: &StatsQueue, idx: usize) -> bool {
  queue.get(idx + 1).is_some_and(|next| {
    next.pcnt_second_ref > FLASH_SR_FLOOR
      && next.pcnt_second_ref >= next.pcnt_inter
  })
}

// How much of the previous reference quality survives this frame,
//  judged by the growth of the second-reference error relative to the
//  first, the motion amplitude, and the intra percentage.
fn sr_decay_rate(s: &FirstPassStats, num_mbs: f64) -> f64 {
  let sr_diff = (s.sr_coded_error - s.coded_error) / num_mbs;
  let mut sr_decay = 1.0;
  if sr_diff > LOW_SR_DIFF_THRESH {
    let sr_diff = sr_diff.min(SR_DIFF_MAX);
    let motion_amplitude =
      s.pcnt_motion * (s.mv_row_abs + s.mv_col_abs) / 2.0;
    let pct_intra = 100.0 * (1.0 - s.pcnt_inter);
    sr_decay = 1.0
      - SR_DIFF_PART * sr_diff
      - MOTION_AMP_PART * motion_amplitude
      - INTRA_PART * pct_intra;
  }
  sr_decay.max(DEFAULT_DECAY_LIMIT.min(s.pcnt_inter))
}

/// Per-frame prediction decay rate in (0, 1].
pub(crate) fn prediction_decay_rate(
  s: &FirstPassStats, num_mbs: f64,
) -> f64 {
  let zero_motion_factor =
    0.95 * s.zero_motion_pct().powf(ZM_POWER_FACTOR);
  zero_motion_factor.max(sr_decay_rate(s, num_mbs)).max(MIN_DECAY_FACTOR)
}

/// Motion statistics accumulated over a stats window.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MotionAccumulator {
  /// Net balance of motion into vs. out of the frame.
  pub motion_in_out: f64,
  /// Sum of absolute in/out contributions (overall motion/zoom level).
  pub abs_motion_in_out: f64,
  /// Uniformity of the motion field: low when motion is coherent.
  pub mv_ratio: f64,
}

impl MotionAccumulator {
  /// Folds one frame in and returns that frame's own in/out balance.
  pub fn accumulate(&mut self, s: &FirstPassStats) -> f64 {
    let pct = s.pcnt_motion;
    let this_in_out = s.mv_in_out * pct;
    self.motion_in_out += this_in_out;
    self.abs_motion_in_out += this_in_out.abs();
    if pct > 0.05 {
      let mvr_ratio = s.mv_row_abs / safe_divisor(s.mv_row.abs());
      let mvc_ratio = s.mv_col_abs / safe_divisor(s.mv_col.abs());
      self.mv_ratio += pct * mvr_ratio.min(s.mv_row_abs);
      self.mv_ratio += pct * mvc_ratio.min(s.mv_col_abs);
    }
    this_in_out
  }
}

/// Boost contribution of a single frame.
///
/// The ratio of a baseline error over the frame's own coded error,
/// scaled by a quantizer-dependent correction and by the in/out motion
/// balance: content entering the frame boosts, content leaving
/// discounts.
pub(crate) fn calc_frame_boost(
  s: &FirstPassStats, this_in_out: f64, q_correction: f64, num_mbs: f64,
  max_boost: f64,
) -> f64 {
  let active_area = (1.0 - s.intra_skip_pct).max(0.01);
  let mut boost = (BASELINE_ERR_PER_MB * active_area * num_mbs)
    / safe_divisor(s.coded_error);
  boost *= q_correction;
  if this_in_out > 0.0 {
    boost += boost * (this_in_out * 2.0);
  } else {
    boost += boost * (this_in_out / 2.0);
  }
  boost.min(max_boost * q_correction)
}

/// Decay-weighted boost over a forward and a backward window around
/// `offset`.
///
/// Flash frames are excluded from the decay update so that a two-frame
/// strobe does not read as a permanent loss of prediction quality. The
/// result is floored both by a window-length term and by an absolute
/// minimum, so a degenerate window cannot produce an unstable score.
pub(crate) fn calc_arf_boost(
  queue: &StatsQueue, offset: usize, f_frames: usize, b_frames: usize,
  q_correction: f64, num_mbs: f64,
) -> i32 {
  let mut score = 0.0;
  let mut frames_visited = 0i32;

  let mut acc = MotionAccumulator::default();
  let mut decay = 1.0;
  for i in 0..f_frames {
    let Some(s) = queue.get(offset + i) else { break };
    let this_in_out = acc.accumulate(s);
    let flash = detect_flash(queue, offset + i);
    if !flash {
      decay *= prediction_decay_rate(s, num_mbs);
    }
    score += decay
      * calc_frame_boost(
        s,
        this_in_out,
        q_correction,
        num_mbs,
        MAX_FRAME_BOOST,
      );
    frames_visited += 1;
  }

  let mut acc = MotionAccumulator::default();
  let mut decay = 1.0;
  for i in 0..b_frames {
    if offset < i + 1 {
      break;
    }
    let idx = offset - i - 1;
    let Some(s) = queue.get(idx) else { break };
    let this_in_out = acc.accumulate(s);
    let flash = detect_flash(queue, idx);
    if !flash {
      decay *= prediction_decay_rate(s, num_mbs);
    }
    score += decay
      * calc_frame_boost(
        s,
        this_in_out,
        q_correction,
        num_mbs,
        MAX_FRAME_BOOST,
      );
    frames_visited += 1;
  }

  (score as i32)
    .max(frames_visited * MIN_BOOST_PER_FRAME)
    .max(MIN_ARF_BOOST)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::firstpass::synthetic_stats;

  fn queue_of(n: u64) -> StatsQueue {
    let mut q = StatsQueue::new();
    for i in 0..n {
      q.push(synthetic_stats(i));
    }
    q
  }

  #[test]
  fn flash_detected_from_next_frame() {
    let mut q = StatsQueue::new();
    q.push(synthetic_stats(0));
    // Frame 1 is the flash: frame 2 prefers its second reference.
    q.push(synthetic_stats(1));
    let mut after = synthetic_stats(2);
    after.pcnt_second_ref = 0.7;
    after.pcnt_inter = 0.6;
    q.push(after);
    assert!(detect_flash(&q, 1));
    assert!(!detect_flash(&q, 0));
    // No record after the last frame: nothing to detect with.
    assert!(!detect_flash(&q, 2));
  }

  #[test]
  fn decay_rate_bounded() {
    let q = queue_of(4);
    let s = q.get(1).unwrap();
    let rate = prediction_decay_rate(s, 3600.0);
    assert!(rate > 0.0 && rate <= 1.0);

    // A catastrophically bad frame still cannot fall below the floor.
    let mut bad = synthetic_stats(0);
    bad.sr_coded_error = 1e9;
    bad.coded_error = 1e3;
    bad.pcnt_inter = 0.0;
    assert!(prediction_decay_rate(&bad, 3600.0) >= MIN_DECAY_FACTOR);
  }

  #[test]
  fn frame_boost_rises_with_incoming_motion() {
    let s = synthetic_stats(0);
    let base = calc_frame_boost(&s, 0.0, 1.0, 3600.0, MAX_FRAME_BOOST);
    let zoom_out = calc_frame_boost(&s, 0.2, 1.0, 3600.0, 1e9);
    let zoom_in = calc_frame_boost(&s, -0.2, 1.0, 3600.0, 1e9);
    assert!(zoom_out > base || base == MAX_FRAME_BOOST);
    assert!(zoom_in < zoom_out);
  }

  #[test]
  fn arf_boost_floors() {
    // An empty window still reports a usable minimum.
    let q = queue_of(1);
    let boost = calc_arf_boost(&q, 0, 0, 0, 1.0, 3600.0);
    assert_eq!(boost, MIN_ARF_BOOST);

    // A long window is floored proportionally to its length.
    let q = queue_of(32);
    let boost = calc_arf_boost(&q, 8, 8, 8, 1.0, 3600.0);
    assert!(boost >= 16 * 50);
  }

  #[test]
  fn motion_accumulator_tracks_balance() {
    let mut acc = MotionAccumulator::default();
    let mut s = synthetic_stats(0);
    s.mv_in_out = 0.5;
    s.pcnt_motion = 0.4;
    let v = acc.accumulate(&s);
    assert!((v - 0.2).abs() < 1e-9);
    s.mv_in_out = -0.5;
    acc.accumulate(&s);
    assert!(acc.motion_in_out.abs() < 1e-9);
    assert!((acc.abs_motion_in_out - 0.4).abs() < 1e-9);
  }
}

// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Closed-loop rate control: quantizer selection from a bit target and
//! the post-encode correction feedback.

use num_derive::FromPrimitive;

use crate::api::{PlannerConfig, RateControlMode};
use crate::gop::FrameRole;
use crate::util::clamp;

/// Size of the quantizer index space.
pub const QINDEX_RANGE: usize = 256;

/// The number of rate classes for which we track distinct correction
/// factors.
pub const RATE_FACTOR_LEVELS: usize = 4;

// Clamp range for the per-class correction factors.
const MIN_BPB_FACTOR: f64 = 0.005;
const MAX_BPB_FACTOR: f64 = 50.0;

// Boost at or above which a golden/alt-ref frame uses the high-boost
//  rate class.
const GF_HIGH_BOOST_THRESH: i32 = 2000;

/// Rate classes with independently corrected bits-per-mb models.
///
/// The ordinal positions are compared against tuned boost cutoffs, so
/// the ordering here is load-bearing and must not be rearranged.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive,
)]
pub enum RateFactorLevel {
  /// Key frames.
  KeyFrame = 0,
  /// Golden or alt-ref frames with a high boost.
  GfArfHigh,
  /// Golden or alt-ref frames with a modest boost.
  GfArfLow,
  /// Ordinary inter frames.
  InterNormal,
}

/// A bits-per-macroblock model, monotonically decreasing in quantizer
/// index. The concrete quantizer tables of a given encoder are a tuned
/// artifact, so the model is pluggable.
pub trait RateModel {
  /// Quantizer step size for an index; strictly increasing.
  fn quantizer_step(&self, qindex: u8) -> f64;

  /// Modeled bits per macroblock at `qindex`, scaled by the active
  /// correction factor.
  fn bits_per_mb(
    &self, level: RateFactorLevel, qindex: u8, correction: f64,
  ) -> f64 {
    let enumerator = match level {
      RateFactorLevel::KeyFrame => 2_700_000.0,
      _ => 1_800_000.0,
    };
    enumerator * correction / self.quantizer_step(qindex)
  }
}

/// Log-linear quantizer curve: rate behaves as `scale / q` with the
/// step doubling at a fixed index cadence.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRateModel {
  min_step: f64,
  max_step: f64,
}

impl Default for DefaultRateModel {
  fn default() -> Self {
    DefaultRateModel { min_step: 4.0, max_step: 1755.0 }
  }
}

impl RateModel for DefaultRateModel {
  fn quantizer_step(&self, qindex: u8) -> f64 {
    let t = f64::from(qindex) / (QINDEX_RANGE - 1) as f64;
    self.min_step * (self.max_step / self.min_step).powf(t)
  }
}

/// Encode-session-scoped rate control state.
///
/// Created once per session, passed by reference into every per-frame
/// call, and reset explicitly at a new session boundary; nothing here
/// is ambient or global.
#[derive(Debug, Clone)]
pub struct RateControlState {
  mode: RateControlMode,
  num_mbs: f64,
  best_quantizer: u8,
  worst_quantizer: u8,
  base_quantizer: u8,
  correction: [f64; RATE_FACTOR_LEVELS],
  // Running average quantizer index: [key frames, inter frames].
  avg_frame_qindex: [f64; 2],
  // The two most recently used inter quantizers, newest first.
  last_inter_q: [u8; 2],
  avg_frame_bandwidth: i64,
  bits_off_target: i64,
  buffer_level: i64,
  optimal_buffer: i64,
  maximum_buffer: i64,
  /// Length of the group currently being consumed.
  pub group_interval: u64,
  /// Frames remaining until the next key frame.
  pub frames_to_key: u64,
  /// Frames remaining until the next group boundary.
  pub frames_till_group_end: u64,
}

impl RateControlState {
  pub fn new(config: &PlannerConfig) -> Self {
    let num_mbs = ((config.width + 15) / 16) as f64
      * ((config.height + 15) / 16) as f64;
    let avg_frame_bandwidth = i64::from(config.target_bitrate)
      * config.time_base.num as i64
      / config.time_base.den.max(1) as i64;
    let buffer_bits =
      |ms: u64| i64::from(config.target_bitrate) * ms as i64 / 1000;
    let mut state = RateControlState {
      mode: config.mode,
      num_mbs,
      best_quantizer: config.best_quantizer,
      worst_quantizer: config.worst_quantizer,
      base_quantizer: config.base_quantizer,
      correction: [1.0; RATE_FACTOR_LEVELS],
      avg_frame_qindex: [0.0; 2],
      last_inter_q: [0; 2],
      avg_frame_bandwidth,
      bits_off_target: 0,
      buffer_level: 0,
      optimal_buffer: buffer_bits(config.optimal_buffer_ms),
      maximum_buffer: buffer_bits(config.maximum_buffer_ms),
      group_interval: 0,
      frames_to_key: 0,
      frames_till_group_end: 0,
    };
    state.reset();
    state
  }

  /// Returns the state to its session-start condition.
  pub fn reset(&mut self) {
    self.correction = [1.0; RATE_FACTOR_LEVELS];
    let worst = f64::from(self.worst_quantizer);
    self.avg_frame_qindex = [worst, worst];
    self.last_inter_q = [self.worst_quantizer; 2];
    self.bits_off_target = self.optimal_buffer;
    self.buffer_level = self.optimal_buffer;
  }

  pub fn avg_frame_bandwidth(&self) -> i64 {
    self.avg_frame_bandwidth
  }

  pub fn buffer_level(&self) -> i64 {
    self.buffer_level
  }

  pub(crate) fn num_mbs(&self) -> f64 {
    self.num_mbs
  }

  pub fn correction_factor(&self, level: RateFactorLevel) -> f64 {
    self.correction[level as usize]
  }

  /// Running average inter quantizer index.
  pub(crate) fn avg_inter_qindex(&self) -> f64 {
    self.avg_frame_qindex[1]
  }

  /// The rate class a frame of `role` with `boost` belongs to.
  pub fn rate_factor_level(
    role: FrameRole, boost: i32,
  ) -> RateFactorLevel {
    match role {
      FrameRole::Key => RateFactorLevel::KeyFrame,
      FrameRole::Golden | FrameRole::AltRef => {
        if boost >= GF_HIGH_BOOST_THRESH {
          RateFactorLevel::GfArfHigh
        } else {
          RateFactorLevel::GfArfLow
        }
      }
      FrameRole::IntnlAltRef => RateFactorLevel::GfArfLow,
      FrameRole::Leaf | FrameRole::Overlay | FrameRole::IntnlOverlay => {
        RateFactorLevel::InterNormal
      }
    }
  }

  /// Finds the quantizer whose modeled bits per mb is the smallest
  /// value still at or above the per-mb target, by bisection over the
  /// closed range [quality_floor, quality_ceiling].
  ///
  /// Out-of-range targets clamp to the bounds; this never fails.
  pub fn select_quantizer(
    &self, model: &dyn RateModel, level: RateFactorLevel,
    target_bits: i64, quality_floor: u8, quality_ceiling: u8,
  ) -> u8 {
    debug_assert!(quality_floor <= quality_ceiling);
    if target_bits <= 0 {
      return quality_ceiling;
    }
    let correction = self.correction[level as usize];
    let target_per_mb = target_bits as f64 / self.num_mbs;

    if model.bits_per_mb(level, quality_floor, correction)
      < target_per_mb
    {
      // Even the best allowed quantizer models under the target.
      return quality_floor;
    }
    if model.bits_per_mb(level, quality_ceiling, correction)
      >= target_per_mb
    {
      return quality_ceiling;
    }
    let mut lo = quality_floor;
    let mut hi = quality_ceiling;
    while hi - lo > 1 {
      let mid = lo + (hi - lo) / 2;
      if model.bits_per_mb(level, mid, correction) >= target_per_mb {
        lo = mid;
      } else {
        hi = mid;
      }
    }
    lo
  }

  /// Selects a quantizer and applies the constant-bitrate swing damper:
  /// when consecutive inter quantizers oscillate in opposite
  /// directions, the new index is clamped between the last two used.
  pub fn pick_quantizer(
    &mut self, model: &dyn RateModel, level: RateFactorLevel,
    target_bits: i64, quality_floor: u8, quality_ceiling: u8,
  ) -> u8 {
    let mut q = self.select_quantizer(
      model,
      level,
      target_bits,
      quality_floor,
      quality_ceiling,
    );
    if self.mode == RateControlMode::Constant
      && level == RateFactorLevel::InterNormal
    {
      let [q1, q2] = self.last_inter_q;
      let new_dir = i32::from(q) - i32::from(q1);
      let old_dir = i32::from(q1) - i32::from(q2);
      if new_dir * old_dir < 0 {
        q = clamp(q, q1.min(q2), q1.max(q2));
        // The damper must not escape the frame's active range.
        q = clamp(q, quality_floor, quality_ceiling);
      }
      self.last_inter_q = [q, q1];
    }
    q
  }

  /// Feeds back the real encoded size of a frame, adjusting the active
  /// rate class's correction factor and the buffer level.
  ///
  /// Overshoot is damped more heavily than undershoot, so a single
  /// blown frame shifts the model slowly while a string of small
  /// frames recovers quickly.
  pub fn post_encode_update(
    &mut self, model: &dyn RateModel, level: RateFactorLevel,
    qindex: u8, actual_bits: i64,
  ) {
    let lvl = level as usize;
    let projected = model
      .bits_per_mb(level, qindex, self.correction[lvl])
      * self.num_mbs;
    if projected >= 1.0 && actual_bits > 0 {
      let raw_pct = 100.0 * actual_bits as f64 / projected;
      // Inside the dead zone the model is close enough; leave the
      //  factor alone rather than chase noise.
      let pct = if raw_pct > 102.0 {
        100.0 + (raw_pct - 100.0) / 4.0
      } else if raw_pct < 99.0 {
        100.0 - (100.0 - raw_pct) / 2.0
      } else {
        100.0
      };
      self.correction[lvl] = clamp(
        self.correction[lvl] * pct / 100.0,
        MIN_BPB_FACTOR,
        MAX_BPB_FACTOR,
      );
      debug!(
        "rate class {:?}: actual {}b vs projected {}b, correction {:.4}",
        level, actual_bits, projected as i64, self.correction[lvl]
      );
    }

    let avg_idx = usize::from(level != RateFactorLevel::KeyFrame);
    self.avg_frame_qindex[avg_idx] =
      (3.0 * self.avg_frame_qindex[avg_idx] + f64::from(qindex)) / 4.0;

    self.update_buffer(actual_bits);
  }

  /// Charges a frame's bits against the leaky bucket without touching
  /// the model corrections. Used for frames that code no new pixels.
  pub fn update_buffer(&mut self, actual_bits: i64) {
    self.bits_off_target += self.avg_frame_bandwidth - actual_bits;
    self.bits_off_target = self.bits_off_target.min(self.maximum_buffer);
    self.buffer_level = self.bits_off_target;
  }

  /// Active quality range for the next frame of the given rate class.
  /// Constant-quality mode pins both ends to the configured quantizer.
  pub fn quality_bounds(&self, level: RateFactorLevel) -> (u8, u8) {
    if self.mode == RateControlMode::ConstantQuality {
      return (self.base_quantizer, self.base_quantizer);
    }
    let best = i32::from(self.best_quantizer);
    let worst = i32::from(self.worst_quantizer);
    let avg_key = self.avg_frame_qindex[0] as i32;
    let avg_inter = self.avg_frame_qindex[1] as i32;
    let active_best = match level {
      RateFactorLevel::KeyFrame => best + (avg_key - best) / 4,
      RateFactorLevel::GfArfHigh => best + (avg_inter - best) / 3,
      RateFactorLevel::GfArfLow => best + (avg_inter - best) / 2,
      RateFactorLevel::InterNormal => best + (avg_inter - best) * 3 / 4,
    };
    let mut active_worst = worst;
    if self.mode == RateControlMode::Constant
      && self.buffer_level > self.optimal_buffer
    {
      // A comfortably full buffer lets us insist on finer quantizers.
      active_worst = worst - (worst - avg_inter) / 4;
    }
    let active_best = clamp(active_best, best, worst);
    let active_worst = clamp(active_worst, active_best, worst);
    (active_best as u8, active_worst as u8)
  }

  /// In constant-bitrate mode, whether the buffer has drained so far
  /// that dropping the next droppable frame is preferable to any
  /// quantizer the range still allows.
  pub fn should_drop_frame(&self) -> bool {
    self.mode == RateControlMode::Constant
      && self.buffer_level < -(self.maximum_buffer >> 2)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::PlannerConfig;

  fn state() -> RateControlState {
    let config = PlannerConfig {
      width: 320,
      height: 240,
      target_bitrate: 1_000_000,
      mode: RateControlMode::Variable,
      ..Default::default()
    };
    RateControlState::new(&config)
  }

  #[test]
  fn model_is_monotone() {
    let model = DefaultRateModel::default();
    let mut prev_step = 0.0;
    let mut prev_bits = f64::MAX;
    for qi in 0..QINDEX_RANGE {
      let step = model.quantizer_step(qi as u8);
      let bits =
        model.bits_per_mb(RateFactorLevel::InterNormal, qi as u8, 1.0);
      assert!(step > prev_step);
      assert!(bits < prev_bits);
      prev_step = step;
      prev_bits = bits;
    }
  }

  #[test]
  fn select_quantizer_is_pure() {
    let rc = state();
    let model = DefaultRateModel::default();
    let a = rc.select_quantizer(
      &model,
      RateFactorLevel::InterNormal,
      40_000,
      10,
      200,
    );
    let b = rc.select_quantizer(
      &model,
      RateFactorLevel::InterNormal,
      40_000,
      10,
      200,
    );
    assert_eq!(a, b);
  }

  #[test]
  fn select_quantizer_meets_target_from_above() {
    let rc = state();
    let model = DefaultRateModel::default();
    let target = 1_500_000i64;
    let q = rc.select_quantizer(
      &model,
      RateFactorLevel::InterNormal,
      target,
      0,
      255,
    );
    let per_mb = target as f64 / rc.num_mbs;
    let at_q = model.bits_per_mb(RateFactorLevel::InterNormal, q, 1.0);
    assert!(at_q >= per_mb);
    if q < 255 {
      let next =
        model.bits_per_mb(RateFactorLevel::InterNormal, q + 1, 1.0);
      assert!(next < per_mb);
    }
  }

  #[test]
  fn select_quantizer_clamps_to_bounds() {
    let rc = state();
    let model = DefaultRateModel::default();
    // An absurd target cannot escape the floor.
    let q = rc.select_quantizer(
      &model,
      RateFactorLevel::InterNormal,
      i64::MAX / 2,
      20,
      200,
    );
    assert_eq!(q, 20);
    // A zero target sits at the ceiling.
    let q = rc.select_quantizer(
      &model,
      RateFactorLevel::InterNormal,
      0,
      20,
      200,
    );
    assert_eq!(q, 200);
  }

  #[test]
  fn correction_factor_stays_clamped() {
    let mut rc = state();
    let model = DefaultRateModel::default();
    for _ in 0..500 {
      rc.post_encode_update(
        &model,
        RateFactorLevel::InterNormal,
        128,
        i64::MAX / 4,
      );
    }
    assert!(
      rc.correction_factor(RateFactorLevel::InterNormal)
        <= MAX_BPB_FACTOR
    );
    for _ in 0..500 {
      rc.post_encode_update(&model, RateFactorLevel::InterNormal, 128, 1);
    }
    assert!(
      rc.correction_factor(RateFactorLevel::InterNormal)
        >= MIN_BPB_FACTOR
    );
  }

  #[test]
  fn overshoot_corrects_more_slowly_than_undershoot() {
    let model = DefaultRateModel::default();
    let mut over = state();
    let projected =
      model.bits_per_mb(RateFactorLevel::InterNormal, 128, 1.0)
        * over.num_mbs;
    over.post_encode_update(
      &model,
      RateFactorLevel::InterNormal,
      128,
      (projected * 1.5) as i64,
    );
    let mut under = state();
    under.post_encode_update(
      &model,
      RateFactorLevel::InterNormal,
      128,
      (projected * 0.5) as i64,
    );
    let up = over.correction_factor(RateFactorLevel::InterNormal) - 1.0;
    let down =
      1.0 - under.correction_factor(RateFactorLevel::InterNormal);
    assert!(up > 0.0 && down > 0.0);
    assert!(up < down);
  }

  #[test]
  fn cbr_swing_damping_blocks_oscillation() {
    let config = PlannerConfig {
      target_bitrate: 500_000,
      mode: RateControlMode::Constant,
      ..Default::default()
    };
    let mut rc = RateControlState::new(&config);
    let model = DefaultRateModel::default();
    // Establish a downward-then-upward swing.
    rc.last_inter_q = [100, 140];
    let q =
      rc.pick_quantizer(&model, RateFactorLevel::InterNormal, 1, 0, 255);
    // The raw choice would be 255 (tiny target); damping holds it
    //  inside the recent window.
    assert!(q >= 100 && q <= 140);
  }

  #[test]
  fn buffer_level_tracks_off_target_bits() {
    let mut rc = state();
    let model = DefaultRateModel::default();
    let start = rc.buffer_level();
    let bw = rc.avg_frame_bandwidth();
    rc.post_encode_update(
      &model,
      RateFactorLevel::InterNormal,
      128,
      bw * 3,
    );
    assert_eq!(rc.buffer_level(), start - 2 * bw);
    // Filling faster than draining caps at the buffer size.
    for _ in 0..10_000 {
      rc.post_encode_update(&model, RateFactorLevel::InterNormal, 128, 0);
    }
    assert!(rc.buffer_level() <= rc.maximum_buffer);
  }

  #[test]
  fn constant_quality_pins_bounds() {
    let config = PlannerConfig {
      mode: RateControlMode::ConstantQuality,
      base_quantizer: 100,
      ..Default::default()
    };
    let rc = RateControlState::new(&config);
    assert_eq!(rc.quality_bounds(RateFactorLevel::KeyFrame), (100, 100));
  }
}

// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! The public planner surface: configuration, the per-frame parameter
//! stream, and the post-encode feedback entry point.

mod config;
mod internal;


pub use config::*;

use thiserror::Error;

use crate::firstpass::{FirstPassStats, StatsQueue};
use crate::gop::FrameRole;
use crate::rate::{RateControlState, RateModel};
use crate::refslots::RefMapSnapshot;
use internal::PlannerInner;

/// A rational number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub struct Rational {
  /// Numerator.
  pub num: u64,
  /// Denominator.
  pub den: u64,
}

impl Rational {
  /// Creates a rational number from the given numerator and
  /// denominator.
  pub const fn new(num: u64, den: u64) -> Self {
    Rational { num, den }
  }

  /// Returns a rational number that is the reciprocal of the given one.
  pub const fn from_reciprocal(reciprocal: Self) -> Self {
    Rational { num: reciprocal.den, den: reciprocal.num }
  }

  /// Returns the rational number as a floating-point number.
  pub fn as_f64(self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

/// Status that can be returned by [`TwoPassPlanner`] calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum PlannerStatus {
  /// The planner needs more first-pass stats before it can commit the
  /// next group. Push more records, or call
  /// [`TwoPassPlanner::finish_stats`] at end of stream.
  #[error("need more data")]
  NeedMoreData,
  /// Every analyzed frame has been planned and handed out.
  #[error("limit reached")]
  LimitReached,
}

/// Everything the frame encoder needs to code one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameParams {
  /// Display-order number of the source frame.
  pub frameno: u64,
  /// Role of the frame within its group.
  pub role: FrameRole,
  /// Depth in the coding pyramid; 0 is the root.
  pub layer_depth: u8,
  /// Bit budget for this frame.
  pub target_bits: i64,
  /// Selected quantizer index.
  pub qindex: u8,
  /// Finest quantizer the rate controller allowed.
  pub quality_floor: u8,
  /// Coarsest quantizer the rate controller allowed.
  pub quality_ceiling: u8,
  /// Reference remapping table for this frame.
  pub ref_map: RefMapSnapshot,
  /// Physical reference slot this frame refreshes.
  pub refresh_slot: u8,
  /// Whether this frame only redisplays an already-coded picture.
  pub show_existing: bool,
  /// Whether the rate controller recommends dropping this frame.
  pub drop_recommended: bool,
}

/// The second-pass planner.
///
/// Owns every piece of rate-control state for one encode session. Feed
/// it first-pass stats with [`push_stats`], then alternate
/// [`next_frame_params`] and [`report_encoded`] as frames are coded.
///
/// [`push_stats`]: TwoPassPlanner::push_stats
/// [`next_frame_params`]: TwoPassPlanner::next_frame_params
/// [`report_encoded`]: TwoPassPlanner::report_encoded
pub struct TwoPassPlanner {
  inner: PlannerInner,
}

impl TwoPassPlanner {
  /// Creates a planner for one encode session.
  ///
  /// # Errors
  ///
  /// Returns [`InvalidConfig`] if the settings contradict each other.
  pub fn new(config: PlannerConfig) -> Result<Self, InvalidConfig> {
    config.validate()?;
    Ok(TwoPassPlanner { inner: PlannerInner::new(config) })
  }

  /// The configuration the planner was built with.
  pub fn config(&self) -> &PlannerConfig {
    self.inner.config()
  }

  /// Replaces the bits-per-mb model used for quantizer selection.
  pub fn set_rate_model(&mut self, model: Box<dyn RateModel + Send>) {
    self.inner.set_rate_model(model);
  }

  /// Appends one first-pass record. Records must arrive in display
  /// order.
  pub fn push_stats(&mut self, stats: FirstPassStats) {
    self.inner.push_stats(stats);
  }

  /// Marks the end of the stats stream; the final group is then
  /// finalized from whatever frames remain.
  pub fn finish_stats(&mut self) {
    self.inner.finish_stats();
  }

  /// Alias for [`finish_stats`]: cancelling an encode is simply
  /// ceasing to push stats and flushing the in-progress group.
  ///
  /// [`finish_stats`]: TwoPassPlanner::finish_stats
  pub fn flush(&mut self) {
    self.inner.finish_stats();
  }

  /// Forces a key frame at the given display frame number. Must be
  /// requested before planning reaches that frame.
  pub fn request_key_frame(&mut self, frameno: u64) {
    self.inner.request_key_frame(frameno);
  }

  /// Hands out the parameters for the next frame in coding order.
  ///
  /// # Errors
  ///
  /// [`PlannerStatus::NeedMoreData`] until enough lookahead stats are
  /// present; [`PlannerStatus::LimitReached`] once every analyzed
  /// frame has been planned.
  pub fn next_frame_params(
    &mut self,
  ) -> Result<FrameParams, PlannerStatus> {
    self.inner.next_frame_params()
  }

  /// Reports the real encoded size of the frame last handed out,
  /// driving the correction-factor and buffer feedback. A size of 0
  /// for a droppable frame records a dropped frame.
  pub fn report_encoded(&mut self, bytes: u64) {
    self.inner.report_encoded(bytes);
  }

  /// Read access to the rate-control state, for inspection.
  pub fn rate_state(&self) -> &RateControlState {
    &self.inner.rc
  }

  /// Read access to the stats queue, for inspection.
  pub fn stats(&self) -> &StatsQueue {
    self.inner.stats()
  }
}

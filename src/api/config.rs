// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

use crate::api::Rational;
use crate::gop::MAX_PYRAMID_DEPTH;

/// How the bit budget is paced across the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub enum RateControlMode {
  /// Hold quality constant and let the rate float.
  ConstantQuality,
  /// Hit the target on average over the whole stream.
  Variable,
  /// Variable rate under a streaming buffer ceiling.
  Constrained,
  /// Hold the rate constant frame to frame.
  Constant,
}

impl fmt::Display for RateControlMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::RateControlMode::*;
    match self {
      ConstantQuality => write!(f, "constant quality"),
      Variable => write!(f, "variable bitrate"),
      Constrained => write!(f, "constrained bitrate"),
      Constant => write!(f, "constant bitrate"),
    }
  }
}

/// Signals accumulated while scanning a group, offered to the alt-ref
/// decision hook.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AltRefFeatures {
  /// Combined boost over the scanned interval.
  pub boost: i32,
  /// Length of the scanned interval in frames.
  pub interval: u64,
  /// Residual prediction-decay accumulator at the end of the scan.
  pub decay_accumulator: f64,
  /// Lowest zero-motion fraction seen in the interval.
  pub zero_motion_pct: f64,
  /// Accumulated absolute in/out motion (motion/zoom level).
  pub abs_motion_in_out: f64,
}

/// Planner settings, invariant over one encode session.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub struct PlannerConfig {
  /// Width of the frames in pixels.
  pub width: usize,
  /// Height of the frames in pixels.
  pub height: usize,
  /// Video time base.
  pub time_base: Rational,

  /// Target bitrate in bits per second; ignored in constant-quality
  /// mode.
  pub target_bitrate: i32,
  /// Rate pacing mode.
  pub mode: RateControlMode,

  /// The *minimum* interval between two key frames.
  pub min_key_frame_interval: u64,
  /// The *maximum* interval between two key frames.
  pub max_key_frame_interval: u64,
  /// Whether scene cuts may place key frames ahead of the interval.
  pub auto_key_frame_detection: bool,

  /// The *minimum* length of a group of pictures.
  pub min_group_interval: u64,
  /// The *maximum* length of a group of pictures.
  pub max_group_interval: u64,
  /// Deepest pyramid layer the structure builder may create.
  pub max_pyramid_depth: u8,
  /// Whether groups may code a hidden alt-ref frame.
  pub enable_alt_ref: bool,

  /// Lowest (finest) allowed quantizer index.
  pub best_quantizer: u8,
  /// Highest (coarsest) allowed quantizer index.
  pub worst_quantizer: u8,
  /// The quantizer used by constant-quality mode.
  pub base_quantizer: u8,

  /// Largest frame size as a percentage of the average per-frame
  /// bandwidth.
  pub max_frame_bandwidth_pct: u32,
  /// Exponent (percent) biasing bit shares toward complex frames.
  pub vbr_bias_pct: u32,
  /// Per-frame error clamp, lower bound, in percent of the average.
  pub vbr_min_section_pct: u32,
  /// Per-frame error clamp, upper bound, in percent of the average.
  pub vbr_max_section_pct: u32,

  /// How many stats records past the current frame the planner may
  /// require before committing a group.
  pub lookahead_frames: usize,

  /// Buffer fullness the leaky bucket steers toward, in milliseconds.
  pub optimal_buffer_ms: u64,
  /// Total leaky-bucket size in milliseconds.
  pub maximum_buffer_ms: u64,

  /// Boost assigned to key frames of fully static groups.
  pub static_kf_boost: i32,

  /// External alt-ref decision, replacing the built-in boost
  /// threshold when set.
  #[cfg_attr(feature = "serialize", serde(skip))]
  pub alt_ref_decision: Option<fn(&AltRefFeatures) -> bool>,
}

impl Default for PlannerConfig {
  fn default() -> Self {
    PlannerConfig {
      width: 640,
      height: 480,
      time_base: Rational { num: 1, den: 30 },
      target_bitrate: 0,
      mode: RateControlMode::ConstantQuality,
      min_key_frame_interval: 12,
      max_key_frame_interval: 240,
      auto_key_frame_detection: true,
      min_group_interval: 4,
      max_group_interval: 16,
      max_pyramid_depth: 4,
      enable_alt_ref: true,
      best_quantizer: 4,
      worst_quantizer: 255,
      base_quantizer: 128,
      max_frame_bandwidth_pct: 800,
      vbr_bias_pct: 50,
      vbr_min_section_pct: 0,
      vbr_max_section_pct: 2000,
      lookahead_frames: 48,
      optimal_buffer_ms: 5000,
      maximum_buffer_ms: 6000,
      static_kf_boost: 5400,
      alt_ref_decision: None,
    }
  }
}

impl PlannerConfig {
  /// Returns the video frame rate computed from
  /// [`time_base`](#structfield.time_base).
  pub fn frame_rate(&self) -> f64 {
    Rational::from_reciprocal(self.time_base).as_f64()
  }

  /// Largest size any single frame may take, in bits.
  pub(crate) fn max_frame_bits(&self) -> i64 {
    let avg = i64::from(self.target_bitrate)
      * self.time_base.num as i64
      / self.time_base.den.max(1) as i64;
    avg * i64::from(self.max_frame_bandwidth_pct) / 100
  }

  /// Checks the settings for contradictions.
  ///
  /// # Errors
  ///
  /// Returns an [`InvalidConfig`] naming the first offending setting.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    if self.width == 0 || self.height == 0 {
      return Err(InvalidConfig::ZeroFrameSize);
    }
    if self.time_base.num == 0 || self.time_base.den == 0 {
      return Err(InvalidConfig::ZeroTimeBase);
    }
    if self.min_key_frame_interval > self.max_key_frame_interval {
      return Err(InvalidConfig::KeyFrameIntervalsReversed);
    }
    if self.min_group_interval > self.max_group_interval
      || self.min_group_interval == 0
    {
      return Err(InvalidConfig::GroupIntervalsReversed);
    }
    if self.max_pyramid_depth == 0
      || self.max_pyramid_depth > MAX_PYRAMID_DEPTH
    {
      return Err(InvalidConfig::PyramidDepthOutOfRange);
    }
    if self.best_quantizer > self.worst_quantizer {
      return Err(InvalidConfig::QuantizerRangeReversed);
    }
    if self.mode != RateControlMode::ConstantQuality
      && self.target_bitrate <= 0
    {
      return Err(InvalidConfig::TargetBitrateRequired);
    }
    if self.lookahead_frames as u64 <= self.max_group_interval {
      // The scan phase cannot commit a group it has not fully seen.
      return Err(InvalidConfig::LookaheadTooShort);
    }
    if self.optimal_buffer_ms > self.maximum_buffer_ms {
      return Err(InvalidConfig::BufferLevelsReversed);
    }
    Ok(())
  }
}

impl fmt::Display for PlannerConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let pairs = [
      ("width", self.width.to_string()),
      ("height", self.height.to_string()),
      ("mode", self.mode.to_string()),
      ("bitrate", self.target_bitrate.to_string()),
      ("keyint_min", self.min_key_frame_interval.to_string()),
      ("keyint_max", self.max_key_frame_interval.to_string()),
      ("auto_key", self.auto_key_frame_detection.to_string()),
      ("gopint_min", self.min_group_interval.to_string()),
      ("gopint_max", self.max_group_interval.to_string()),
      ("pyramid_depth", self.max_pyramid_depth.to_string()),
      ("alt_ref", self.enable_alt_ref.to_string()),
      ("best_q", self.best_quantizer.to_string()),
      ("worst_q", self.worst_quantizer.to_string()),
      ("base_q", self.base_quantizer.to_string()),
      ("lookahead", self.lookahead_frames.to_string()),
    ];
    write!(
      f,
      "{}",
      pairs.iter().map(|pair| format!("{}={}", pair.0, pair.1)).join(" ")
    )
  }
}

/// A setting rejected by [`PlannerConfig::validate`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum InvalidConfig {
  /// Frame width or height is zero.
  #[error("width and height must be nonzero")]
  ZeroFrameSize,
  /// The time base has a zero term.
  #[error("time base terms must be nonzero")]
  ZeroTimeBase,
  /// Minimum key-frame interval exceeds the maximum.
  #[error("minimum key frame interval exceeds maximum")]
  KeyFrameIntervalsReversed,
  /// Group interval range is empty or reversed.
  #[error("group interval range is empty or reversed")]
  GroupIntervalsReversed,
  /// Pyramid depth is zero or above the supported maximum.
  #[error("pyramid depth out of range")]
  PyramidDepthOutOfRange,
  /// Best quantizer is coarser than the worst.
  #[error("quantizer range is reversed")]
  QuantizerRangeReversed,
  /// A bitrate mode was chosen without a target bitrate.
  #[error("target bitrate required for this rate control mode")]
  TargetBitrateRequired,
  /// The lookahead window cannot cover one whole group.
  #[error("lookahead must exceed the maximum group interval")]
  LookaheadTooShort,
  /// Optimal buffer level exceeds the buffer size.
  #[error("optimal buffer level exceeds maximum")]
  BufferLevelsReversed,
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn default_config_is_valid() {
    assert_eq!(PlannerConfig::default().validate(), Ok(()));
  }

  #[test]
  fn bitrate_modes_require_a_bitrate() {
    let config = PlannerConfig {
      mode: RateControlMode::Variable,
      target_bitrate: 0,
      ..Default::default()
    };
    assert_eq!(
      config.validate(),
      Err(InvalidConfig::TargetBitrateRequired)
    );
  }

  #[test]
  fn reversed_ranges_are_rejected() {
    let config = PlannerConfig {
      min_key_frame_interval: 300,
      ..Default::default()
    };
    assert_eq!(
      config.validate(),
      Err(InvalidConfig::KeyFrameIntervalsReversed)
    );

    let config =
      PlannerConfig { best_quantizer: 200, worst_quantizer: 100, ..Default::default() };
    assert_eq!(
      config.validate(),
      Err(InvalidConfig::QuantizerRangeReversed)
    );
  }

  #[test]
  fn lookahead_must_cover_a_group() {
    let config = PlannerConfig {
      max_group_interval: 64,
      lookahead_frames: 32,
      ..Default::default()
    };
    assert_eq!(config.validate(), Err(InvalidConfig::LookaheadTooShort));
  }

  #[test]
  fn display_lists_key_settings() {
    let shown = PlannerConfig::default().to_string();
    assert!(shown.contains("keyint_max=240"));
    assert!(shown.contains("mode=constant quality"));
  }
}

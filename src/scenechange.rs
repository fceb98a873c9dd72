// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Key-frame placement: scene-cut detection over the stats stream, the
//! forced-interval fallback, and sizing of the key frame and its group.

use std::collections::BTreeSet;

use crate::api::PlannerConfig;
use crate::boost;
use crate::firstpass::{modified_error, StatsQueue};
use crate::util::safe_divisor;

// Scene-cut candidate thresholds.
const SECOND_REF_USAGE_THRESH: f64 = 0.085;
const VERY_LOW_INTER_THRESH: f64 = 0.05;
const KF_II_ERR_THRESHOLD: f64 = 2.5;
const ERR_CHANGE_THRESHOLD: f64 = 0.4;
const II_IMPROVEMENT_THRESHOLD: f64 = 3.5;

// Lookahead confirmation of a candidate cut.
const KF_BOOST_SCAN_MAX_FRAMES: usize = 16;
const KF_II_MAX: f64 = 128.0;
const BOOST_FACTOR: f64 = 12.5;
const KF_CONFIRMATION_THRESH: f64 = 30.0;
const KF_CONTINUITY_BREAK: f64 = 6.25;

// Key-frame boost floors.
const MIN_KF_BOOST: i32 = 300;
const STATIC_ZERO_MOTION_THRESH: f64 = 0.99;

/// What the scanner learned about the next key frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyFrameSignals {
  /// Frames from this key frame to the next one.
  pub interval: u64,
  /// Boost score of the key frame itself.
  pub boost: i32,
  /// Bits reserved for the whole key-frame group.
  pub group_bits: i64,
}

// A candidate scene cut shows low second-reference usage combined with
//  either a collapse of inter prediction or an abrupt change in the
//  error signature, and the frames after it must confirm that they
//  predict well from the candidate.
fn test_candidate_kf(queue: &StatsQueue, idx: usize) -> bool {
  let last = match idx.checked_sub(1).and_then(|i| queue.get(i)) {
    Some(s) => s,
    None => return false,
  };
  let (this, next) = match (queue.get(idx), queue.get(idx + 1)) {
    (Some(t), Some(n)) => (t, n),
    _ => return false,
  };

  if this.pcnt_second_ref >= SECOND_REF_USAGE_THRESH
    || next.pcnt_second_ref >= SECOND_REF_USAGE_THRESH
  {
    return false;
  }

  let err_change = (last.coded_error - this.coded_error).abs()
    / safe_divisor(this.coded_error)
    > ERR_CHANGE_THRESHOLD
    || (last.intra_error - this.intra_error).abs()
      / safe_divisor(this.intra_error)
      > ERR_CHANGE_THRESHOLD;
  let ii_improves =
    next.intra_inter_ratio() > II_IMPROVEMENT_THRESHOLD;
  let candidate = this.pcnt_inter < VERY_LOW_INTER_THRESH
    || (this.intra_inter_ratio() < KF_II_ERR_THRESHOLD
      && (err_change || ii_improves));
  if !candidate {
    return false;
  }

  // Confirm against the following frames so a one or two frame flash
  //  does not read as a cut: the decay-weighted intra/inter score of
  //  the frames predicted from the candidate must clear a threshold.
  let mut boost_score = 0.0;
  let mut old_boost_score = 0.0;
  let mut decay_accumulator = 1.0;
  let mut i = 0;
  while i < KF_BOOST_SCAN_MAX_FRAMES {
    let f = match queue.get(idx + 1 + i) {
      Some(f) => f,
      None => break,
    };
    let next_iiratio = (BOOST_FACTOR * f.intra_error
      / safe_divisor(f.coded_error))
    .min(KF_II_MAX);
    decay_accumulator *= if f.pcnt_inter > 0.85 {
      f.pcnt_inter
    } else {
      (0.85 + f.pcnt_inter) / 2.0
    };
    boost_score += decay_accumulator * next_iiratio;
    if boost_score - old_boost_score < KF_CONTINUITY_BREAK {
      break;
    }
    old_boost_score = boost_score;
    i += 1;
  }
  let confirmed = boost_score > KF_CONFIRMATION_THRESH && i > 3;
  debug!(
    "kf candidate at {}: {} (confirmation score {:.1} over {} frames)",
    idx,
    if confirmed { "scenecut" } else { "rejected" },
    boost_score,
    i
  );
  confirmed
}

/// Scans forward from the key frame at `start` to find the next key
/// frame, and sizes this key frame and its group.
///
/// Stops at a forced key frame or a confirmed scene cut; if the natural
/// interval overshoots the configured maximum the scan runs on to twice
/// the maximum and the interval is halved, centering the forced cut.
pub(crate) fn find_next_key_frame(
  queue: &StatsQueue, config: &PlannerConfig, start: usize,
  forced: &BTreeSet<u64>, bits_left: i64, modified_error_left: f64,
  q_correction: f64, num_mbs: f64,
) -> KeyFrameSignals {
  let max = config.max_key_frame_interval.max(1) as usize;
  let min = config.min_key_frame_interval as usize;
  let scan_limit = 2 * max;

  let mut interval = scan_limit;
  for d in 1..=scan_limit {
    let idx = start + d;
    if forced.contains(&(idx as u64)) {
      interval = d;
      break;
    }
    if queue.get(idx).is_none() {
      // End of stream ends the group naturally.
      interval = d;
      break;
    }
    if d >= min
      && config.auto_key_frame_detection
      && test_candidate_kf(queue, idx)
    {
      interval = d;
      break;
    }
  }
  if interval > max {
    // Center the forced cut inside an over-long natural interval.
    interval /= 2;
  }
  let interval = interval.max(1);

  // Reserve a share of the remaining budget proportional to this
  //  group's share of the remaining error.
  let av_err = queue.totals().av_error();
  let err_min = av_err * f64::from(config.vbr_min_section_pct) / 100.0;
  let err_max = av_err * f64::from(config.vbr_max_section_pct) / 100.0;
  let mut kf_group_err = 0.0;
  let mut min_zero_motion = 1.0f64;
  for d in 0..interval {
    if let Some(s) = queue.get(start + d) {
      kf_group_err += modified_error(
        queue.totals(),
        s,
        config.vbr_bias_pct,
        err_min,
        err_max,
      );
      min_zero_motion = min_zero_motion.min(s.zero_motion_pct());
    }
  }
  let group_bits = if modified_error_left > f64::EPSILON {
    ((bits_left.max(0) as f64)
      * (kf_group_err / modified_error_left).min(1.0)) as i64
  } else {
    0
  };

  let f_frames = interval.min(KF_BOOST_SCAN_MAX_FRAMES);
  let b_frames = start.min(KF_BOOST_SCAN_MAX_FRAMES);
  let mut kf_boost = boost::calc_arf_boost(
    queue,
    start,
    f_frames,
    b_frames,
    q_correction,
    num_mbs,
  );
  if min_zero_motion >= STATIC_ZERO_MOTION_THRESH {
    // A static group gets a deterministic boost: the error-ratio
    //  arithmetic is meaningless at near-zero coded error.
    kf_boost = config.static_kf_boost;
  }
  let kf_boost =
    kf_boost.max(3 * interval as i32).max(MIN_KF_BOOST);

  debug!(
    "key frame at {}: interval {}, boost {}, group bits {}",
    start, interval, kf_boost, group_bits
  );
  KeyFrameSignals {
    interval: interval as u64,
    boost: kf_boost,
    group_bits,
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::firstpass::{synthetic_stats, FirstPassStats};

  fn normal_frame(i: u64) -> FirstPassStats {
    synthetic_stats(i)
  }

  fn cut_frame(i: u64) -> FirstPassStats {
    FirstPassStats {
      pcnt_second_ref: 0.02,
      pcnt_inter: 0.03,
      intra_error: 4000.0,
      coded_error: 3500.0,
      ..synthetic_stats(i)
    }
  }

  // A frame shortly after a cut: well predicted from the new scene.
  fn settled_frame(i: u64) -> FirstPassStats {
    FirstPassStats {
      pcnt_second_ref: 0.02,
      pcnt_inter: 0.95,
      intra_error: 4000.0,
      coded_error: 300.0,
      ..synthetic_stats(i)
    }
  }

  fn clip_with_cut(cut_at: u64, len: u64) -> StatsQueue {
    let mut q = StatsQueue::new();
    for i in 0..len {
      if i == cut_at {
        q.push(cut_frame(i));
      } else if i > cut_at && i < cut_at + 20 {
        q.push(settled_frame(i));
      } else {
        q.push(normal_frame(i));
      }
    }
    q.finish();
    q
  }

  fn config() -> PlannerConfig {
    PlannerConfig {
      min_key_frame_interval: 12,
      max_key_frame_interval: 240,
      ..Default::default()
    }
  }

  #[test]
  fn scene_cut_found_and_confirmed() {
    let q = clip_with_cut(40, 120);
    let signals = find_next_key_frame(
      &q,
      &config(),
      0,
      &BTreeSet::new(),
      8_000_000,
      1e9,
      1.0,
      3600.0,
    );
    assert_eq!(signals.interval, 40);
    assert!(signals.boost >= MIN_KF_BOOST);
    assert!(signals.group_bits > 0);
  }

  #[test]
  fn flash_is_not_a_cut() {
    // Two frames of a camera flash, then back to the old scene: the
    //  confirmation scan sees the post-flash frames predict poorly
    //  from the flash frame and rejects the candidate.
    let flash_frame = |i: u64| FirstPassStats {
      pcnt_second_ref: 0.02,
      pcnt_inter: 0.03,
      intra_error: 4000.0,
      coded_error: 3800.0,
      ..synthetic_stats(i)
    };
    let mut q = StatsQueue::new();
    for i in 0..100u64 {
      if (40..=42).contains(&i) {
        // 40 and 41 flash; 42 re-cuts back to the old scene.
        q.push(flash_frame(i));
      } else {
        q.push(normal_frame(i));
      }
    }
    q.finish();
    let signals = find_next_key_frame(
      &q,
      &config(),
      0,
      &BTreeSet::new(),
      8_000_000,
      1e9,
      1.0,
      3600.0,
    );
    // Normal frames predict moderately; the scan runs to the stream
    //  end instead of cutting at the flash.
    assert!(signals.interval > 41);
  }

  #[test]
  fn forced_key_frame_overrides_detection() {
    let q = clip_with_cut(40, 120);
    let mut forced = BTreeSet::new();
    forced.insert(25u64);
    let signals = find_next_key_frame(
      &q,
      &config(),
      0,
      &forced,
      8_000_000,
      1e9,
      1.0,
      3600.0,
    );
    assert_eq!(signals.interval, 25);
  }

  #[test]
  fn interval_clamps_to_maximum() {
    let mut q = StatsQueue::new();
    for i in 0..200u64 {
      q.push(normal_frame(i));
    }
    q.finish();
    let cfg = PlannerConfig {
      min_key_frame_interval: 12,
      max_key_frame_interval: 60,
      ..Default::default()
    };
    let signals = find_next_key_frame(
      &q,
      &cfg,
      0,
      &BTreeSet::new(),
      8_000_000,
      1e9,
      1.0,
      3600.0,
    );
    // No cut within 2x the maximum: forced to the maximum itself.
    assert_eq!(signals.interval, 60);
  }

  #[test]
  fn overlong_natural_interval_is_centered() {
    let q = clip_with_cut(90, 200);
    let cfg = PlannerConfig {
      min_key_frame_interval: 12,
      max_key_frame_interval: 60,
      ..Default::default()
    };
    let signals = find_next_key_frame(
      &q,
      &cfg,
      0,
      &BTreeSet::new(),
      8_000_000,
      1e9,
      1.0,
      3600.0,
    );
    assert_eq!(signals.interval, 45);
  }

  #[test]
  fn static_scene_takes_configured_boost() {
    let mut q = StatsQueue::new();
    for i in 0..200u64 {
      q.push(FirstPassStats {
        pcnt_inter: 1.0,
        pcnt_motion: 0.0,
        intra_error: 1e-4,
        coded_error: 1e-5,
        sr_coded_error: 1e-5,
        ..synthetic_stats(i)
      });
    }
    q.finish();
    let cfg = PlannerConfig {
      min_key_frame_interval: 12,
      max_key_frame_interval: 60,
      static_kf_boost: 5400,
      ..Default::default()
    };
    let signals = find_next_key_frame(
      &q,
      &cfg,
      0,
      &BTreeSet::new(),
      8_000_000,
      1e9,
      1.0,
      3600.0,
    );
    assert_eq!(signals.interval, 60);
    assert_eq!(signals.boost, 5400);
  }

  #[test]
  fn detection_disabled_runs_to_maximum() {
    let q = clip_with_cut(40, 200);
    let cfg = PlannerConfig {
      auto_key_frame_detection: false,
      min_key_frame_interval: 12,
      max_key_frame_interval: 60,
      ..Default::default()
    };
    let signals = find_next_key_frame(
      &q,
      &cfg,
      0,
      &BTreeSet::new(),
      8_000_000,
      1e9,
      1.0,
      3600.0,
    );
    assert_eq!(signals.interval, 60);
  }
}

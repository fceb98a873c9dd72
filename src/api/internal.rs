// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::collections::BTreeSet;

use crate::api::{
  AltRefFeatures, FrameParams, PlannerConfig, PlannerStatus,
};
use crate::boost::{self, MotionAccumulator};
use crate::firstpass::{modified_error, FirstPassStats, StatsQueue};
use crate::gop::{
  build_gop_plan, FrameRole, GopPlan, MIN_ALTREF_INTERVAL,
};
use crate::rate::{
  DefaultRateModel, RateControlState, RateFactorLevel, RateModel,
};
use crate::refslots::RefSlotStacks;
use crate::scenechange;

// Built-in alt-ref rule: boost above this uses an alt-ref. Sits just
//  above the degenerate-window floor so that empty windows never earn
//  a hidden frame.
const ALT_REF_BOOST_THRESH: i32 = 250;

// Group scan breakouts.
const MOTION_BREAKOUT: f64 = 2.0;
const STILL_DECAY_THRESH: f64 = 0.999;
const MOTION_DECAY_THRESH: f64 = 0.9;

// Extra records the key-frame scanner may touch past its scan range
//  (candidate lookahead confirmation).
const KF_SCAN_MARGIN: usize = 17;

// The frame most recently handed to the encoder, so the post-encode
//  callback knows which rate class and slot to settle.
struct PendingFrame {
  role: FrameRole,
  level: RateFactorLevel,
  refresh_slot: u8,
  qindex: u8,
  droppable: bool,
}

// What the SCAN phase learned about the next group.
struct ScanOutcome {
  interval: u64,
  group_err: f64,
  decay_accumulator: f64,
  zero_motion_pct: f64,
  abs_motion_in_out: f64,
}

pub(crate) struct PlannerInner {
  config: PlannerConfig,
  pub(crate) rc: RateControlState,
  model: Box<dyn RateModel + Send>,
  stacks: RefSlotStacks,
  stats: StatsQueue,
  forced_key_frames: BTreeSet<u64>,
  // Key-frame group state.
  kf_boost: i32,
  kf_group_bits: i64,
  // Current group.
  plan: Option<GopPlan>,
  plan_cursor: usize,
  gop_start_frameno: u64,
  prev_group_had_alt_ref: bool,
  pending: Option<PendingFrame>,
}

impl PlannerInner {
  pub fn new(config: PlannerConfig) -> Self {
    PlannerInner {
      rc: RateControlState::new(&config),
      config,
      model: Box::new(DefaultRateModel::default()),
      stacks: RefSlotStacks::new(),
      stats: StatsQueue::new(),
      forced_key_frames: BTreeSet::new(),
      kf_boost: 0,
      kf_group_bits: 0,
      plan: None,
      plan_cursor: 0,
      gop_start_frameno: 0,
      prev_group_had_alt_ref: false,
      pending: None,
    }
  }

  pub fn set_rate_model(&mut self, model: Box<dyn RateModel + Send>) {
    self.model = model;
  }

  pub fn config(&self) -> &PlannerConfig {
    &self.config
  }

  pub fn stats(&self) -> &StatsQueue {
    &self.stats
  }

  pub fn push_stats(&mut self, stats: FirstPassStats) {
    self.stats.push(stats);
  }

  pub fn finish_stats(&mut self) {
    self.stats.finish();
  }

  pub fn request_key_frame(&mut self, frameno: u64) {
    self.forced_key_frames.insert(frameno);
  }

  // Quantizer-dependent boost correction: cheap quantizers damp the
  //  boost arithmetic, coarse ones saturate it.
  fn boost_q_correction(&self) -> f64 {
    let avg_q = self.rc.avg_inter_qindex().min(255.0).max(0.0) as u8;
    (0.5 + 0.015 * self.model.quantizer_step(avg_q)).min(1.5)
  }

  fn remaining_frames(&self) -> u64 {
    (self.stats.len() as u64).saturating_sub(self.gop_start_frameno)
  }

  // Bits nominally left for everything not yet planned.
  fn bits_left(&self) -> i64 {
    self.rc.avg_frame_bandwidth() * self.remaining_frames() as i64
  }

  // Modified error summed over all frames not yet planned.
  fn modified_error_left(&self) -> f64 {
    let (err_min, err_max) = self.modified_error_bounds();
    let mut left = 0.0;
    for idx in self.gop_start_frameno as usize..self.stats.len() {
      if let Some(s) = self.stats.get(idx) {
        left += modified_error(
          self.stats.totals(),
          s,
          self.config.vbr_bias_pct,
          err_min,
          err_max,
        );
      }
    }
    left
  }

  fn modified_error_bounds(&self) -> (f64, f64) {
    let av_err = self.stats.totals().av_error();
    (
      av_err * f64::from(self.config.vbr_min_section_pct) / 100.0,
      av_err * f64::from(self.config.vbr_max_section_pct) / 100.0,
    )
  }

  // Blocks until the stats window required to commit the next decision
  //  is present, or the stream has been finished.
  fn stats_gate(&self, needed_through: usize) -> Result<(), PlannerStatus> {
    if self.stats.is_finished() || self.stats.len() > needed_through {
      Ok(())
    } else {
      Err(PlannerStatus::NeedMoreData)
    }
  }

  // SCAN phase: walk the stats forward from the anchor, accumulating
  //  decay and motion signals, until a stopping condition fires.
  fn scan_group(&self, limit: u64) -> ScanOutcome {
    let start = self.gop_start_frameno as usize;
    let (err_min, err_max) = self.modified_error_bounds();
    let mut acc = MotionAccumulator::default();
    let mut decay_accumulator = 1.0f64;
    let mut loop_decay = 1.0f64;
    let mut last_loop_decay = 1.0f64;
    let mut zero_motion_pct = 1.0f64;
    let mut group_err = 0.0f64;
    let num_mbs = self.rc.num_mbs();

    let mut interval = 1u64;
    for i in 1..=limit {
      let Some(s) = self.stats.get(start + i as usize) else {
        interval = i;
        break;
      };
      group_err += modified_error(
        self.stats.totals(),
        s,
        self.config.vbr_bias_pct,
        err_min,
        err_max,
      );
      zero_motion_pct = zero_motion_pct.min(s.zero_motion_pct());
      acc.accumulate(s);
      if !boost::detect_flash(&self.stats, start + i as usize) {
        last_loop_decay = loop_decay;
        loop_decay = boost::prediction_decay_rate(s, num_mbs);
        decay_accumulator *= loop_decay;
      }
      interval = i;
      if i >= self.config.min_group_interval {
        let motion_breakout =
          i % 2 == 1 && acc.abs_motion_in_out > MOTION_BREAKOUT;
        let still_after_motion = loop_decay >= STILL_DECAY_THRESH
          && last_loop_decay < MOTION_DECAY_THRESH;
        if i >= limit || motion_breakout || still_after_motion {
          break;
        }
      }
    }

    ScanOutcome {
      interval,
      group_err,
      decay_accumulator,
      zero_motion_pct,
      abs_motion_in_out: acc.abs_motion_in_out,
    }
  }

  // PLAN phase: turn the scanned interval into a published GopPlan.
  fn define_group(&mut self) -> Result<(), PlannerStatus> {
    let start = self.gop_start_frameno as usize;
    if start >= self.stats.len() {
      return if self.stats.is_finished() {
        Err(PlannerStatus::LimitReached)
      } else {
        Err(PlannerStatus::NeedMoreData)
      };
    }

    let is_key_group = self.rc.frames_to_key == 0;
    let q_correction = self.boost_q_correction();
    let num_mbs = self.rc.num_mbs();

    if is_key_group {
      let kf_window =
        2 * self.config.max_key_frame_interval as usize + KF_SCAN_MARGIN;
      self.stats_gate(start + kf_window)?;
      let signals = scenechange::find_next_key_frame(
        &self.stats,
        &self.config,
        start,
        &self.forced_key_frames,
        self.bits_left(),
        self.modified_error_left(),
        q_correction,
        num_mbs,
      );
      self.rc.frames_to_key = signals.interval;
      self.kf_boost = signals.boost;
      self.kf_group_bits = signals.group_bits;
    } else {
      self.stats_gate(start + self.config.lookahead_frames)?;
    }

    let limit = self
      .config
      .max_group_interval
      .min(self.rc.frames_to_key)
      .max(1);
    let scan = self.scan_group(limit);
    let mut interval = scan.interval;

    // If the tail left before the key frame is too short to host its
    //  own alt-ref, hand it one frame from this group instead of
    //  coding an unbalanced runt group.
    let remaining_after = self.rc.frames_to_key - interval;
    if remaining_after > 0
      && remaining_after < MIN_ALTREF_INTERVAL
      && interval > self.config.min_group_interval
    {
      interval -= 1;
    }

    let b_frames = (interval as usize).min(16).min(start);
    let gf_boost = boost::calc_arf_boost(
      &self.stats,
      start + 1,
      interval as usize,
      b_frames,
      q_correction,
      num_mbs,
    );

    let features = AltRefFeatures {
      boost: gf_boost,
      interval,
      decay_accumulator: scan.decay_accumulator,
      zero_motion_pct: scan.zero_motion_pct,
      abs_motion_in_out: scan.abs_motion_in_out,
    };
    let mut use_alt_ref = match self.config.alt_ref_decision {
      Some(predict) => predict(&features),
      None => {
        self.config.enable_alt_ref
          && interval >= MIN_ALTREF_INTERVAL
          && gf_boost >= ALT_REF_BOOST_THRESH
      }
    };
    // An alt-ref sources the next anchor's frame, so it cannot cross a
    //  key frame or the end of the stream: its overlay would never be
    //  coded.
    use_alt_ref = use_alt_ref
      && interval < self.rc.frames_to_key
      && self.stats.get(start + interval as usize).is_some();

    // The group's budget is its share of the remaining error, capped
    //  by the per-frame maximum.
    let modified_error_left = self.modified_error_left();
    let mut total_bits = if modified_error_left > f64::EPSILON {
      ((self.bits_left().max(0) as f64)
        * (scan.group_err / modified_error_left).min(1.0)) as i64
    } else {
      0
    };
    let max_frame_bits = self.config.max_frame_bits();
    total_bits = total_bits.min(max_frame_bits * interval as i64);

    let anchor_role = if is_key_group {
      FrameRole::Key
    } else if self.prev_group_had_alt_ref {
      FrameRole::Overlay
    } else {
      FrameRole::Golden
    };
    let next_anchor_role = if self.rc.frames_to_key == interval {
      FrameRole::Key
    } else if use_alt_ref {
      FrameRole::Overlay
    } else {
      FrameRole::Golden
    };

    let mut plan = build_gop_plan(
      anchor_role,
      next_anchor_role,
      interval,
      use_alt_ref,
      self.config.max_pyramid_depth,
      &self.stacks,
    );
    plan.base_boost = gf_boost;

    // Each internal alt-ref is boosted over the subtree it serves.
    for slot in plan.slots.iter_mut() {
      if slot.role != FrameRole::IntnlAltRef {
        continue;
      }
      let span = ((interval >> (slot.layer_depth.max(2) - 1)) as usize)
        .max(2);
      slot.boost = boost::calc_arf_boost(
        &self.stats,
        start + slot.disp_offset as usize,
        span,
        span.min(slot.disp_offset as usize),
        q_correction,
        num_mbs,
      );
    }

    let kf_bits = if is_key_group {
      let bits = crate::alloc::boost_bits(
        self.rc.frames_to_key.saturating_sub(1) as i32,
        self.kf_boost,
        self.kf_group_bits,
      );
      plan.slots[0].target_bits = bits;
      plan.slots[0].boost = self.kf_boost;
      total_bits = (total_bits - bits).max(0);
      bits
    } else {
      0
    };

    crate::alloc::allocate_gop_bits(
      &mut plan,
      total_bits,
      max_frame_bits,
      is_key_group,
    );
    if is_key_group {
      plan.slots[0].target_bits = kf_bits;
    }
    plan.total_bits = total_bits + kf_bits;

    debug!(
      "group at {}: interval {}, alt_ref {}, boost {}, bits {}",
      start, interval, use_alt_ref, gf_boost, plan.total_bits
    );

    self.rc.group_interval = interval;
    self.rc.frames_till_group_end = interval;
    self.prev_group_had_alt_ref = use_alt_ref;
    self.stats.mark_consumed(start);
    self.plan = Some(plan);
    self.plan_cursor = 0;
    Ok(())
  }

  fn plan_exhausted(&self) -> bool {
    match &self.plan {
      Some(plan) => self.plan_cursor + 1 >= plan.slots.len(),
      None => true,
    }
  }

  /// Hands out the parameters for the next frame in coding order,
  /// building the next group's plan when the current one is spent.
  pub fn next_frame_params(
    &mut self,
  ) -> Result<FrameParams, PlannerStatus> {
    self.settle_pending(None);
    if self.plan_exhausted() {
      if let Some(plan) = self.plan.take() {
        self.gop_start_frameno += plan.interval;
      }
      self.define_group()?;
    }

    let plan = self.plan.as_mut().expect("group plan was just defined");
    let cursor = self.plan_cursor;
    let slot = &mut plan.slots[cursor];

    let level = RateControlState::rate_factor_level(slot.role, slot.boost);
    let (floor, ceiling) = self.rc.quality_bounds(level);
    let qindex = self.rc.pick_quantizer(
      self.model.as_ref(),
      level,
      slot.target_bits,
      floor,
      ceiling,
    );
    slot.qindex = Some(qindex);

    let droppable = slot.role == FrameRole::Leaf;
    let params = FrameParams {
      frameno: self.gop_start_frameno + slot.disp_offset,
      role: slot.role,
      layer_depth: slot.layer_depth,
      target_bits: slot.target_bits,
      qindex,
      quality_floor: floor,
      quality_ceiling: ceiling,
      ref_map: slot.ref_map,
      refresh_slot: slot.refresh_slot,
      show_existing: slot.role.is_overlay(),
      drop_recommended: droppable && self.rc.should_drop_frame(),
    };
    self.pending = Some(PendingFrame {
      role: slot.role,
      level,
      refresh_slot: slot.refresh_slot,
      qindex,
      droppable,
    });

    if slot.role.is_shown() {
      self.rc.frames_to_key = self.rc.frames_to_key.saturating_sub(1);
      self.rc.frames_till_group_end =
        self.rc.frames_till_group_end.saturating_sub(1);
    }
    self.plan_cursor += 1;
    Ok(params)
  }

  /// Post-encode callback: the actual size of the frame last handed
  /// out. A size of zero on a droppable frame means it was dropped.
  pub fn report_encoded(&mut self, bytes: u64) {
    let bits = bytes.saturating_mul(8).min(i64::MAX as u64) as i64;
    self.settle_pending(Some(bits));
  }

  // Applies the reference and rate bookkeeping for the last emitted
  //  frame. Without an explicit report only the reference state
  //  advances; the model corrections wait for real sizes.
  fn settle_pending(&mut self, actual_bits: Option<i64>) {
    let Some(pending) = self.pending.take() else { return };
    let dropped =
      actual_bits == Some(0) && pending.droppable;
    if !dropped {
      self.stacks.update(pending.role, pending.refresh_slot);
    }
    if let Some(bits) = actual_bits {
      if pending.role.is_overlay() {
        // Redisplays code no new pixels; their cost hits the buffer
        //  but must not skew the model corrections.
        self.rc.update_buffer(bits);
      } else {
        self.rc.post_encode_update(
          self.model.as_ref(),
          pending.level,
          pending.qindex,
          bits,
        );
      }
    }
  }
}

// Copyright (c) 2026, The twopass-rc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Two-pass rate control and group-of-pictures planning for block-based
//! video encoders.
//!
//! Given per-frame statistics from an analysis pass, the planner decides
//! where key frames go, how each group of pictures is structured into a
//! coding pyramid, how many bits every frame may spend, and which
//! quantizer index hits that target, correcting its rate model from the
//! encoder's actual output as the second pass proceeds.

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

mod alloc;
mod boost;
pub mod firstpass;
pub mod gop;
pub mod rate;
pub mod refslots;
mod scenechange;
pub mod util;

mod api;

pub use api::*;

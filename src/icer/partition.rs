// SPDX-License-Identifier: LGPL-2.1

//! Partition split descriptors.
//!
//! A subband is tiled into a grid of near-square segments: a top region of
//! `r_t` rows with `c` columns and, when the target count does not divide
//! evenly, a bottom region of `r - r_t` rows with `c + 1` columns. Within a
//! region the first-N rows/columns use the smaller base dimension and the
//! remainder use base+1, so the grid covers the subband exactly.

use super::{IcerStatus, MAX_SEGMENTS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionParams {
  /// Subband width / height covered by the partition.
  pub w: usize,
  pub h: usize,
  /// Effective segment count.
  pub s: usize,
  /// Total rows of segments and columns in the top region.
  pub r: usize,
  pub c: usize,
  /// Rows and pixel height of the top region.
  pub r_t: usize,
  pub h_t: usize,
  /// Base segment dimensions and first-N splits, top region.
  pub x_t: usize,
  pub y_t: usize,
  pub c_t0: usize,
  pub r_t0: usize,
  /// Same for the bottom region (zero when it does not exist).
  pub x_b: usize,
  pub y_b: usize,
  pub c_b0: usize,
  pub r_b0: usize,
}

fn int_sqrt(v: u64) -> u64 {
  if v < 2 {
    return v;
  }
  let mut x = v;
  let mut y = (x + 1) / 2;
  while y < x {
    x = y;
    y = (x + v / x) / 2;
  }
  x
}

/// Rounded integer sqrt of `num / den`.
fn sqrt_ratio_rounded(num: u64, den: u64) -> u64 {
  // Round r = sqrt(num/den) by comparing the two candidate squares.
  let r = int_sqrt(num / den);
  let lo = r * r * den;
  let hi = (r + 1) * (r + 1) * den;
  if num.saturating_sub(lo) > hi.saturating_sub(num) { r + 1 } else { r }
}

/// Derive the partition of a `w x h` subband into up to `segments` tiles.
pub fn generate_partition_params(w: usize, h: usize, segments: u8) -> Result<PartitionParams, IcerStatus> {
  if w == 0 || h == 0 {
    return Err(IcerStatus::SizeError);
  }
  if segments == 0 || segments as usize > MAX_SEGMENTS {
    return Err(IcerStatus::TooManySegments);
  }

  // Every segment row must be at least one pixel tall, every segment at
  // least one pixel wide.
  let s = (segments as usize).min(h).min(w * h);

  // Rows of segments chosen so segments come out near-square.
  let mut r = sqrt_ratio_rounded(s as u64 * h as u64, w as u64) as usize;
  r = r.clamp(1, s.min(h));
  // Every column of the grid must be at least one pixel wide; the bottom
  // region has c+1 columns. Adding rows narrows the grid until it fits
  // (r == s always fits: a single one-segment column per row).
  loop {
    let c = s / r;
    let fits = if s % r == 0 { c <= w } else { c + 1 <= w };
    if fits {
      break;
    }
    r += 1;
  }

  let c = s / r;
  let r_b = s % r;
  let r_t = r - r_b;

  let h_t = if r_b == 0 { h } else { (2 * h * r_t + r) / (2 * r) };
  let y_t = h_t / r_t;
  let r_t0 = r_t * (y_t + 1) - h_t;
  let x_t = w / c;
  let c_t0 = c * (x_t + 1) - w;

  let (x_b, y_b, c_b0, r_b0) = if r_b > 0 {
    let h_b = h - h_t;
    let y_b = h_b / r_b;
    let r_b0 = r_b * (y_b + 1) - h_b;
    let x_b = w / (c + 1);
    let c_b0 = (c + 1) * (x_b + 1) - w;
    (x_b, y_b, c_b0, r_b0)
  } else {
    (0, 0, 0, 0)
  };

  let params = PartitionParams {
    w,
    h,
    s,
    r,
    c,
    r_t,
    h_t,
    x_t,
    y_t,
    c_t0,
    r_t0,
    x_b,
    y_b,
    c_b0,
    r_b0,
  };
  debug_assert!(params.y_t >= 1 && params.x_t >= 1);
  Ok(params)
}

// SPDX-License-Identifier: LGPL-2.1

//! Single-bitplane compression of a sign-magnitude tile.
//!
//! The tile is scanned in raster order. A sample whose magnitude bits above
//! the current plane are all zero is in the significance pass: its plane bit
//! is coded under a context derived from neighbor significance, and on
//! becoming significant its sign is coded against a neighborhood prediction.
//! Already-significant samples code a magnitude-refinement bit.
//!
//! Neighbor significance is causal: samples before the current one in scan
//! order count their just-coded plane, samples after it only the higher
//! planes. The caller supplies a pointer into a padded buffer whose one-
//! sample border replicates the tile edges, so all eight neighbor reads at
//! `+-1` and `+-stride` are in bounds.

use super::context::ContextModel;
use super::entropy::EntropyCoder;
use super::{BITPLANES_TO_COMPRESS_16, IcerStatus, PacketContext};

#[inline]
fn magnitude(v: u16) -> u32 {
  (v & 0x7FFF) as u32
}

/// Significance of a neighbor already visited this plane.
#[inline]
fn sig_causal(v: u16, lsb: u32) -> bool {
  magnitude(v) >> lsb != 0
}

/// Significance of a neighbor not yet visited this plane.
#[inline]
fn sig_future(v: u16, lsb: u32) -> bool {
  magnitude(v) >> (lsb + 1) != 0
}

#[inline]
fn sign_of(v: u16, significant: bool) -> i32 {
  if !significant {
    0
  } else if v & 0x8000 != 0 {
    -1
  } else {
    1
  }
}

/// Compress the `pkt.lsb` bitplane of a `w x h` tile.
///
/// `first` indexes the first real sample inside `tile`; rows are `stride`
/// apart and the surrounding border must be readable (padded tile).
pub fn compress_bitplane(
  tile: &[u16],
  first: usize,
  w: usize,
  h: usize,
  stride: usize,
  model: &mut ContextModel,
  coder: &mut EntropyCoder<'_>,
  pkt: &PacketContext,
) -> Result<(), IcerStatus> {
  if w == 0 || h == 0 || stride < w {
    return Err(IcerStatus::SizeError);
  }
  if pkt.lsb as usize >= BITPLANES_TO_COMPRESS_16 {
    return Err(IcerStatus::BitplaneOutOfRange);
  }
  // The padded border must surround the real samples.
  if first < stride + 1 || first + (h - 1) * stride + (w - 1) + stride + 1 >= tile.len() {
    return Err(IcerStatus::SizeError);
  }
  let lsb = pkt.lsb as u32;

  for row in 0..h {
    for col in 0..w {
      let pos = first + row * stride + col;
      let v = tile[pos];
      let mag = magnitude(v);
      let bit = (mag >> lsb) & 1 != 0;

      let left = tile[pos - 1];
      let right = tile[pos + 1];
      let top = tile[pos - stride];
      let bottom = tile[pos + stride];

      if mag >> (lsb + 1) == 0 {
        // Significance pass.
        let left_sig = sig_causal(left, lsb);
        let top_sig = sig_causal(top, lsb);
        let right_sig = sig_future(right, lsb);
        let bottom_sig = sig_future(bottom, lsb);
        let h_cnt = left_sig as u32 + right_sig as u32;
        let v_cnt = top_sig as u32 + bottom_sig as u32;
        let d_cnt = sig_causal(tile[pos - stride - 1], lsb) as u32
          + sig_causal(tile[pos - stride + 1], lsb) as u32
          + sig_future(tile[pos + stride - 1], lsb) as u32
          + sig_future(tile[pos + stride + 1], lsb) as u32;

        let ctx = model.significance_context(h_cnt, v_cnt, d_cnt);
        let (zero, total) = model.counts(ctx);
        coder.encode_bit(bit, zero, total)?;
        model.update(ctx, bit);

        if bit {
          let h_sign = (sign_of(left, left_sig) + sign_of(right, right_sig)).clamp(-1, 1);
          let v_sign = (sign_of(top, top_sig) + sign_of(bottom, bottom_sig)).clamp(-1, 1);
          let (sctx, predicted_negative) = ContextModel::sign_context(h_sign, v_sign);
          let negative = v & 0x8000 != 0;
          let disagree = negative != predicted_negative;
          let (zero, total) = model.counts(sctx);
          coder.encode_bit(disagree, zero, total)?;
          model.update(sctx, disagree);
        }
      } else {
        // Refinement pass.
        let first_refinement = mag >> (lsb + 1) == 1;
        let active = sig_causal(left, lsb)
          || sig_causal(top, lsb)
          || sig_future(right, lsb)
          || sig_future(bottom, lsb);
        let ctx = ContextModel::refinement_context(first_refinement, active);
        let (zero, total) = model.counts(ctx);
        coder.encode_bit(bit, zero, total)?;
        model.update(ctx, bit);
      }
    }
  }
  coder.flush()
}

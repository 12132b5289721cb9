// SPDX-License-Identifier: LGPL-2.1

//! LL-mean normalization and sign-magnitude recode of a transformed plane.
//!
//! The LL subband occupies the top-left `low(W,S) x low(H,S)` rectangle of
//! the plane file with full-image row stride. Its integer mean is computed
//! in 64 bits, subtracted in place as signed arithmetic, and the whole
//! plane is then recoded to sign-magnitude through a temp file because the
//! storage abstraction has no atomic rename.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::icer::wavelet::to_sign_magnitude_i16;
use crate::storage::{FileSystem, StorageFile, TempFileGuard, copy_file};
use crate::{IcerError, Result};

const CONVERT_TEMP_FILE: &str = "_temp_convert.tmp";

#[inline]
fn mul(a: usize, b: usize) -> Result<usize> {
  a.checked_mul(b).ok_or(IcerError::Overflow)
}

fn read_ll_subband<F: FileSystem>(fs: &F, name: &str, width: usize, ll_w: usize, ll_h: usize) -> Result<Vec<u16>> {
  let mut samples = Vec::new();
  samples.try_reserve_exact(mul(ll_w, ll_h)?).map_err(|_| IcerError::OutOfMemory)?;
  samples.resize(ll_w * ll_h, 0u16);
  let mut row_bytes = vec![0u8; ll_w * 2];
  let mut file = fs.open_read(name)?;
  for row in 0..ll_h {
    let pos = mul(mul(row, width)?, 2)?;
    file.read_exact_at(pos as u64, &mut row_bytes)?;
    LittleEndian::read_u16_into(&row_bytes, &mut samples[row * ll_w..(row + 1) * ll_w]);
  }
  Ok(samples)
}

/// Integer mean of the `ll_w x ll_h` LL subband. Fails with
/// [`IcerError::LlMeanOverflow`] when the mean exceeds `i16::MAX`.
pub fn ll_subband_mean<F: FileSystem>(fs: &F, name: &str, width: usize, ll_w: usize, ll_h: usize) -> Result<u16> {
  let samples = read_ll_subband(fs, name, width, ll_w, ll_h)?;
  let sum: u64 = samples.iter().map(|&v| u64::from(v)).sum();
  let mean = sum / (ll_w as u64 * ll_h as u64);
  if mean > i16::MAX as u64 {
    return Err(IcerError::LlMeanOverflow);
  }
  debug!("ll mean of {}: {}", name, mean);
  Ok(mean as u16)
}

/// Subtract the channel mean from every LL sample, in place. Only the LL
/// rectangle is touched.
pub fn subtract_ll_mean<F: FileSystem>(fs: &F, name: &str, width: usize, ll_w: usize, ll_h: usize, mean: u16) -> Result<()> {
  let mut samples = read_ll_subband(fs, name, width, ll_w, ll_h)?;
  for v in samples.iter_mut() {
    *v = (*v as i16).wrapping_sub(mean as i16) as u16;
  }
  let mut row_bytes = vec![0u8; ll_w * 2];
  let mut file = fs.open_rw(name)?;
  for row in 0..ll_h {
    let pos = mul(mul(row, width)?, 2)?;
    LittleEndian::write_u16_into(&samples[row * ll_w..(row + 1) * ll_w], &mut row_bytes);
    file.write_all_at(pos as u64, &row_bytes)?;
  }
  file.flush()?;
  Ok(())
}

/// Recode every sample of the plane to sign-magnitude, row by row through a
/// temp file, then copy the temp back over the plane. Applied exactly once
/// per channel per frame; the transform is not self-inverse.
pub fn recode_sign_magnitude<F: FileSystem>(fs: &F, name: &str, width: usize, height: usize) -> Result<()> {
  let row_size = mul(width, 2)?;
  mul(row_size, height)?;

  fs.remove(CONVERT_TEMP_FILE)?;
  let mut guard = TempFileGuard::new(fs);
  guard.push(CONVERT_TEMP_FILE);

  {
    let mut input = fs.open_read(name)?;
    let mut output = fs.open_write(CONVERT_TEMP_FILE)?;
    let mut row_bytes = vec![0u8; row_size];
    let mut row_samples = vec![0u16; width];
    for _row in 0..height {
      input.read_exact(&mut row_bytes)?;
      LittleEndian::read_u16_into(&row_bytes, &mut row_samples);
      to_sign_magnitude_i16(&mut row_samples);
      LittleEndian::write_u16_into(&row_samples, &mut row_bytes);
      output.write_all(&row_bytes)?;
    }
    output.flush()?;
  }

  fs.remove(name)?;
  copy_file(fs, CONVERT_TEMP_FILE, name)?;
  fs.remove(CONVERT_TEMP_FILE)?;
  debug!("sign-magnitude recode of {} complete", name);
  Ok(())
}

// SPDX-License-Identifier: LGPL-2.1

//! Plane separation: one camera frame in, three 16-bit plane files out.
//!
//! Both input paths produce identical plane geometry: `width * height`
//! little-endian u16 samples per channel, row-major, no header. The 8-bit
//! channel values are zero-extended to 16 bits.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use super::jpeg::{JpegDecoder, McuRect};
use crate::storage::{FileSystem, StorageFile, TempFileGuard};
use crate::{IcerError, Result};

const TEMP_JPEG_FILE: &str = "_temp_jpeg.tmp";
const TEMP_RGB_FILE: &str = "_temp_rgb.tmp";

/// Byte order of the interleaved YUV422 camera buffer. Camera hardware
/// differs; this is configuration, not an assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Yuv422Order {
  /// `Y0 U0 Y1 V0 ...`
  #[default]
  Yuyv,
  /// `U0 Y0 V0 Y1 ...`
  Uyvy,
}

/// Split an interleaved YUV422 buffer into three full-width plane files.
///
/// Chroma is horizontally subsampled 2:1 in the input; odd columns
/// replicate the chroma of the preceding even column. A truncated trailing
/// pair falls back to the previous chroma value, or a neutral 128.
pub fn separate_yuv422<F: FileSystem>(
  fs: &F,
  data: &[u8],
  width: usize,
  height: usize,
  order: Yuv422Order,
  y_name: &str,
  u_name: &str,
  v_name: &str,
) -> Result<()> {
  if width == 0 || height == 0 {
    return Err(IcerError::InvalidInput("zero frame dimension"));
  }
  let scanline = width.checked_mul(2).ok_or(IcerError::Overflow)?;
  let expected = scanline.checked_mul(height).ok_or(IcerError::Overflow)?;
  if data.len() < expected {
    return Err(IcerError::InvalidInput("YUV422 buffer shorter than geometry"));
  }

  fs.remove(y_name)?;
  fs.remove(u_name)?;
  fs.remove(v_name)?;

  let mut guard = TempFileGuard::new(fs);
  guard.push(y_name);
  guard.push(u_name);
  guard.push(v_name);

  let mut y_file = fs.open_write(y_name)?;
  let mut u_file = fs.open_write(u_name)?;
  let mut v_file = fs.open_write(v_name)?;

  let mut y_row = vec![0u16; width];
  let mut u_row = vec![0u16; width];
  let mut v_row = vec![0u16; width];
  let mut row_bytes = vec![0u8; width * 2];

  for row in 0..height {
    let src = &data[row * scanline..(row + 1) * scanline];
    for col in 0..width {
      let base = col * 2;
      let (y_idx, u_idx, v_idx) = match order {
        Yuv422Order::Yuyv => (base, base + 1, base + 3),
        Yuv422Order::Uyvy => (base + 1, base, base + 2),
      };
      y_row[col] = u16::from(src[y_idx]);
      if col % 2 == 0 {
        u_row[col] = if u_idx < scanline { u16::from(src[u_idx]) } else { 128 };
        v_row[col] = if v_idx < scanline {
          u16::from(src[v_idx])
        } else if col > 0 {
          v_row[col - 1]
        } else {
          128
        };
      } else {
        u_row[col] = u_row[col - 1];
        v_row[col] = v_row[col - 1];
      }
    }
    LittleEndian::write_u16_into(&y_row, &mut row_bytes);
    y_file.write_all(&row_bytes)?;
    LittleEndian::write_u16_into(&u_row, &mut row_bytes);
    u_file.write_all(&row_bytes)?;
    LittleEndian::write_u16_into(&v_row, &mut row_bytes);
    v_file.write_all(&row_bytes)?;
  }

  y_file.flush()?;
  u_file.flush()?;
  v_file.flush()?;
  guard.disarm();
  debug!("yuv422: wrote {}x{} planes", width, height);
  Ok(())
}

/// ITU-R BT.601 RGB to YUV with 1e6-scaled integer coefficients and
/// truncating division, clamped to the 8-bit range.
#[inline]
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u16, u16, u16) {
  let (r, g, b) = (i64::from(r), i64::from(g), i64::from(b));
  let y = (299_000 * r + 587_000 * g + 114_000 * b) / 1_000_000;
  let u = (-168_736 * r - 331_264 * g + 500_000 * b) / 1_000_000 + 128;
  let v = (500_000 * r - 418_688 * g - 81_312 * b) / 1_000_000 + 128;
  (y.clamp(0, 255) as u16, u.clamp(0, 255) as u16, v.clamp(0, 255) as u16)
}

/// Decode a JPEG frame into three plane files, returning the decoded
/// geometry.
///
/// The compressed buffer is persisted to storage first, then streamed
/// through the baseline decoder into a temporary RGB888 file one MCU
/// rectangle at a time, then converted to YUV scanline by scanline. Peak
/// memory is the decoder working set plus four scanline buffers.
pub fn separate_jpeg<F: FileSystem>(
  fs: &F,
  jpeg: &[u8],
  y_name: &str,
  u_name: &str,
  v_name: &str,
) -> Result<(usize, usize)> {
  if jpeg.is_empty() {
    return Err(IcerError::InvalidInput("empty JPEG buffer"));
  }

  let mut temp_guard = TempFileGuard::new(fs);
  temp_guard.push(TEMP_JPEG_FILE);
  temp_guard.push(TEMP_RGB_FILE);

  let mut plane_guard = TempFileGuard::new(fs);
  plane_guard.push(y_name);
  plane_guard.push(u_name);
  plane_guard.push(v_name);

  // Persist the camera buffer; everything after this streams from storage.
  fs.remove(TEMP_JPEG_FILE)?;
  {
    let mut jpeg_file = fs.open_write(TEMP_JPEG_FILE)?;
    jpeg_file.write_all(jpeg)?;
    jpeg_file.flush()?;
  }
  info!("jpeg: saved {} compressed bytes", jpeg.len());

  // Streaming decode into the RGB temp file by absolute rectangle writes.
  fs.remove(TEMP_RGB_FILE)?;
  let (width, height) = {
    let mut jpeg_in = fs.open_read(TEMP_JPEG_FILE)?;
    let decoder = JpegDecoder::prepare(&mut jpeg_in)?;
    let (width, height) = (decoder.width(), decoder.height());
    let row_size = width.checked_mul(3).ok_or(IcerError::Overflow)?;
    row_size.checked_mul(height).ok_or(IcerError::Overflow)?;

    let mut rgb_out = fs.open_write(TEMP_RGB_FILE)?;
    decoder.decompress(&mut |rect: &McuRect, rgb: &[u8]| {
      if rect.width == 0
        || rect.height == 0
        || rect.left + rect.width > width
        || rect.top + rect.height > height
      {
        return Err(IcerError::DecodeFailed(format!(
          "MCU rectangle {}x{}+{}+{} outside {}x{} frame",
          rect.width, rect.height, rect.left, rect.top, width, height
        )));
      }
      let rect_row = rect.width * 3;
      for y in 0..rect.height {
        let offset = (rect.top + y) * row_size + rect.left * 3;
        rgb_out.write_all_at(offset as u64, &rgb[y * rect_row..(y + 1) * rect_row])?;
      }
      Ok(())
    })?;
    rgb_out.flush()?;
    (width, height)
  };
  fs.remove(TEMP_JPEG_FILE)?;
  info!("jpeg: decoded {}x{} frame", width, height);

  // Scanline RGB -> YUV into the plane files.
  fs.remove(y_name)?;
  fs.remove(u_name)?;
  fs.remove(v_name)?;
  let mut rgb_in = fs.open_read(TEMP_RGB_FILE)?;
  let mut y_file = fs.open_write(y_name)?;
  let mut u_file = fs.open_write(u_name)?;
  let mut v_file = fs.open_write(v_name)?;

  let mut rgb_row = vec![0u8; width * 3];
  let mut y_row = vec![0u16; width];
  let mut u_row = vec![0u16; width];
  let mut v_row = vec![0u16; width];
  let mut row_bytes = vec![0u8; width * 2];

  for _row in 0..height {
    rgb_in.read_exact(&mut rgb_row)?;
    for col in 0..width {
      let (y, u, v) = rgb_to_yuv(rgb_row[col * 3], rgb_row[col * 3 + 1], rgb_row[col * 3 + 2]);
      y_row[col] = y;
      u_row[col] = u;
      v_row[col] = v;
    }
    LittleEndian::write_u16_into(&y_row, &mut row_bytes);
    y_file.write_all(&row_bytes)?;
    LittleEndian::write_u16_into(&u_row, &mut row_bytes);
    u_file.write_all(&row_bytes)?;
    LittleEndian::write_u16_into(&v_row, &mut row_bytes);
    v_file.write_all(&row_bytes)?;
  }
  y_file.flush()?;
  u_file.flush()?;
  v_file.flush()?;

  fs.remove(TEMP_RGB_FILE)?;
  plane_guard.disarm();
  debug!("jpeg: wrote {}x{} planes", width, height);
  Ok((width, height))
}

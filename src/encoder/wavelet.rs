// SPDX-License-Identifier: LGPL-2.1

//! Streaming 2-D dyadic wavelet transform over a plane file.
//!
//! Per stage: a row phase streams each LL row through the 1-D kernel into a
//! compact-stride temp file, then a column phase reads the temp file in
//! interleaved column batches, transforms each column at the batch stride
//! and writes the batch back at full-image stride. Stages after the first
//! first copy the previous output so the surrounding subbands survive, then
//! overwrite only the LL rectangle.
//!
//! Peak memory: one row plus one column batch (<= 150 KB).

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::icer::{FilterType, wavelet};
use crate::storage::{FileSystem, StorageFile, TempFileGuard, copy_file};
use crate::{IcerError, Result};

const ROW_TEMP_FILE: &str = "_wavelet_temp.tmp";
const STAGE_TEMP_FILE: &str = "_wavelet_stage_temp.tmp";

/// Byte budget for the column batch buffer.
const MAX_COL_BUFFER: usize = 150 * 1024;

/// Hard cap on columns per batch.
const MAX_COLS_PER_BATCH: usize = 200;

#[inline]
fn mul(a: usize, b: usize) -> Result<usize> {
  a.checked_mul(b).ok_or(IcerError::Overflow)
}

#[inline]
fn add(a: usize, b: usize) -> Result<usize> {
  a.checked_add(b).ok_or(IcerError::Overflow)
}

/// Apply `stages` decomposition stages to `input`, writing the transformed
/// plane to `output`. The input file is read-only; on failure the output
/// and all temp files are deleted.
pub fn streaming_wavelet_transform<F: FileSystem>(
  fs: &F,
  input: &str,
  output: &str,
  width: usize,
  height: usize,
  stages: u8,
  filter: FilterType,
) -> Result<()> {
  if width == 0 || height == 0 || stages == 0 {
    return Err(IcerError::InvalidInput("bad wavelet geometry"));
  }
  if wavelet::dim_low(width, stages as usize) < 3 || wavelet::dim_low(height, stages as usize) < 3 {
    return Err(IcerError::DimensionsTooSmall(stages));
  }
  let total_bytes = mul(mul(width, height)?, 2)?;

  fs.remove(output)?;
  let mut guard = TempFileGuard::new(fs);
  guard.push(ROW_TEMP_FILE);
  guard.push(STAGE_TEMP_FILE);
  guard.push(output);

  let mut current_w = width;
  let mut current_h = height;

  debug!("wavelet: {} stages over {}x{}", stages, width, height);
  for stage in 0..stages {
    debug!("wavelet: stage {} of {} ({}x{})", stage + 1, stages, current_w, current_h);

    // Phase 1: row transform into the compact-stride temp file. The LL
    // region sits at the origin of the stage input with full-image stride.
    let stage_input = if stage == 0 { input } else { output };
    {
      let mut stage_in = fs.open_read(stage_input)?;
      fs.remove(ROW_TEMP_FILE)?;
      let mut temp_out = fs.open_write(ROW_TEMP_FILE)?;

      let row_size = mul(current_w, 2)?;
      let mut row_bytes = vec![0u8; row_size];
      let mut row_samples = vec![0u16; current_w];

      for row in 0..current_h {
        let file_pos = mul(mul(row, width)?, 2)?;
        stage_in.read_exact_at(file_pos as u64, &mut row_bytes)?;
        LittleEndian::read_u16_into(&row_bytes, &mut row_samples);
        wavelet::wavelet_transform_1d(&mut row_samples, current_w, 1, filter)?;
        LittleEndian::write_u16_into(&row_samples, &mut row_bytes);
        temp_out.write_all(&row_bytes)?;
      }
      temp_out.flush()?;
    }

    // Phase 2: column transform. The first stage writes a fresh output
    // file pre-filled with zeros; later stages update a copy so the high
    // subbands of earlier stages are preserved.
    let stage_output = if stage == 0 { output } else { STAGE_TEMP_FILE };
    {
      let mut temp_in = fs.open_read(ROW_TEMP_FILE)?;
      if stage == 0 {
        fs.remove(stage_output)?;
        let mut stage_out = fs.open_write(stage_output)?;
        let zeros = [0u8; 4096];
        let mut remaining = total_bytes;
        while remaining > 0 {
          let chunk = remaining.min(zeros.len());
          stage_out.write_all(&zeros[..chunk])?;
          remaining -= chunk;
        }
        stage_out.flush()?;
      } else {
        copy_file(fs, output, stage_output)?;
      }
      let mut stage_out = fs.open_rw(stage_output)?;

      let col_size = mul(current_h, 2)?;
      let mut batch_size = if col_size > MAX_COL_BUFFER { 1 } else { MAX_COL_BUFFER / col_size };
      batch_size = batch_size.clamp(1, MAX_COLS_PER_BATCH).min(current_w);

      let mut batch = Vec::new();
      batch.try_reserve_exact(mul(batch_size, current_h)?).map_err(|_| IcerError::OutOfMemory)?;
      batch.resize(batch_size * current_h, 0u16);
      let mut batch_row_bytes = vec![0u8; batch_size * 2];

      let mut col_start = 0usize;
      while col_start < current_w {
        let cols_in_batch = batch_size.min(current_w - col_start);
        let chunk_bytes = cols_in_batch * 2;

        // Read the batch row by row from the compact temp file.
        for row in 0..current_h {
          let pos = add(mul(mul(row, current_w)?, 2)?, mul(col_start, 2)?)?;
          temp_in.read_exact_at(pos as u64, &mut batch_row_bytes[..chunk_bytes])?;
          LittleEndian::read_u16_into(&batch_row_bytes[..chunk_bytes], &mut batch[row * batch_size..row * batch_size + cols_in_batch]);
        }

        // Transform each column at the interleaving stride.
        for col in 0..cols_in_batch {
          wavelet::wavelet_transform_1d(&mut batch[col..], current_h, batch_size, filter)?;
        }

        // Write the batch back at full-image stride.
        for row in 0..current_h {
          let pos = add(mul(mul(row, width)?, 2)?, mul(col_start, 2)?)?;
          LittleEndian::write_u16_into(&batch[row * batch_size..row * batch_size + cols_in_batch], &mut batch_row_bytes[..chunk_bytes]);
          stage_out.write_all_at(pos as u64, &batch_row_bytes[..chunk_bytes])?;
        }

        col_start += cols_in_batch;
      }
      stage_out.flush()?;
    }

    // Later stages worked on a copy; move it over the output.
    if stage > 0 {
      fs.remove(output)?;
      copy_file(fs, STAGE_TEMP_FILE, output)?;
      fs.remove(STAGE_TEMP_FILE)?;
    }
    fs.remove(ROW_TEMP_FILE)?;

    current_w = current_w / 2 + current_w % 2;
    current_h = current_h / 2 + current_h % 2;
  }

  // Keep the output, drop the temps.
  fs.remove(ROW_TEMP_FILE)?;
  fs.remove(STAGE_TEMP_FILE)?;
  guard.disarm();
  debug!("wavelet: transform complete");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::icer::wavelet::{dim_low, wavelet_transform_1d};
  use crate::storage::HostFileSystem;

  fn testfs(name: &str) -> HostFileSystem {
    let dir = std::env::temp_dir().join("icerstream-wavelet").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    HostFileSystem::new(dir).unwrap()
  }

  fn write_plane(fs: &HostFileSystem, name: &str, samples: &[u16]) {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_u16_into(samples, &mut bytes);
    let mut f = fs.open_write(name).unwrap();
    f.write_all(&bytes).unwrap();
  }

  fn read_plane(fs: &HostFileSystem, name: &str, count: usize) -> Vec<u16> {
    let mut bytes = vec![0u8; count * 2];
    let mut f = fs.open_read(name).unwrap();
    f.read_exact(&mut bytes).unwrap();
    let mut samples = vec![0u16; count];
    LittleEndian::read_u16_into(&bytes, &mut samples);
    samples
  }

  /// Reference in-RAM transform: rows then columns per stage on the LL.
  fn reference_transform(plane: &mut [u16], width: usize, height: usize, stages: u8, filter: FilterType) {
    let (mut w, mut h) = (width, height);
    for _ in 0..stages {
      let mut row = vec![0u16; w];
      for r in 0..h {
        row.copy_from_slice(&plane[r * width..r * width + w]);
        wavelet_transform_1d(&mut row, w, 1, filter).unwrap();
        plane[r * width..r * width + w].copy_from_slice(&row);
      }
      let mut col = vec![0u16; h];
      for c in 0..w {
        for r in 0..h {
          col[r] = plane[r * width + c];
        }
        wavelet_transform_1d(&mut col, h, 1, filter).unwrap();
        for r in 0..h {
          plane[r * width + c] = col[r];
        }
      }
      w = w / 2 + w % 2;
      h = h / 2 + h % 2;
    }
  }

  fn ramp_plane(width: usize, height: usize) -> Vec<u16> {
    (0..width * height).map(|i| ((i % width) % 256) as u16).collect()
  }

  #[test]
  fn matches_in_ram_reference() -> Result<()> {
    crate::init_test_logger();
    // Odd dimensions force the ceil-half edge cases; three stages cross
    // multiple batch geometries.
    for &(w, h, stages) in &[(37usize, 29usize, 3u8), (64, 48, 2), (16, 16, 1)] {
      let fs = testfs(&format!("ref-{}x{}-{}", w, h, stages));
      let plane = ramp_plane(w, h);
      write_plane(&fs, "in.raw", &plane);
      streaming_wavelet_transform(&fs, "in.raw", "out.raw", w, h, stages, FilterType::A)?;

      let mut expected = plane.clone();
      reference_transform(&mut expected, w, h, stages, FilterType::A);
      assert_eq!(read_plane(&fs, "out.raw", w * h), expected, "{}x{} s={}", w, h, stages);
      assert!(!fs.exists(ROW_TEMP_FILE));
      assert!(!fs.exists(STAGE_TEMP_FILE));
    }
    Ok(())
  }

  #[test]
  fn small_batch_budget_paths_agree() -> Result<()> {
    crate::init_test_logger();
    // A tall plane forces batch_size down to a handful of columns.
    let (w, h) = (50usize, 400usize);
    let fs = testfs("tall");
    let plane = ramp_plane(w, h);
    write_plane(&fs, "in.raw", &plane);
    streaming_wavelet_transform(&fs, "in.raw", "out.raw", w, h, 2, FilterType::B)?;
    let mut expected = plane;
    reference_transform(&mut expected, w, h, 2, FilterType::B);
    assert_eq!(read_plane(&fs, "out.raw", w * h), expected);
    Ok(())
  }

  #[test]
  fn too_many_stages_fails_and_cleans_up() {
    crate::init_test_logger();
    let fs = testfs("toosmall");
    write_plane(&fs, "in.raw", &ramp_plane(16, 16));
    // Stage 4 would shrink the LL below 3x3.
    assert_eq!(dim_low(16, 3), 2);
    let result = streaming_wavelet_transform(&fs, "in.raw", "out.raw", 16, 16, 3, FilterType::A);
    assert!(matches!(result, Err(IcerError::DimensionsTooSmall(_))));
    assert_eq!(fs.list().unwrap(), ["in.raw"]);
  }

  #[test]
  fn output_file_keeps_full_plane_size() -> Result<()> {
    crate::init_test_logger();
    let fs = testfs("size");
    let (w, h) = (24usize, 18usize);
    write_plane(&fs, "in.raw", &ramp_plane(w, h));
    streaming_wavelet_transform(&fs, "in.raw", "out.raw", w, h, 2, FilterType::A)?;
    let mut out = fs.open_read("out.raw")?;
    assert_eq!(out.size()?, (w * h * 2) as u64);
    Ok(())
  }
}

// SPDX-License-Identifier: LGPL-2.1

//! Partition compression: one subband bitplane, streamed from the plane
//! file segment by segment.
//!
//! Each grid cell is read row by row into a padded tile buffer sized for
//! the partition's largest segment. The one-sample border replicates the
//! edge samples so the bitplane coder's neighbor reads at `+-1` and
//! `+-stride` see defined values without the rest of the plane being
//! resident.

use byteorder::{ByteOrder, LittleEndian};

use crate::icer::bitplane::compress_bitplane;
use crate::icer::context::ContextModel;
use crate::icer::entropy::EntropyCoder;
use crate::icer::{DataStream, IcerStatus, PacketContext, PartitionParams, SegmentHandle};
use crate::storage::StorageFile;
use crate::{IcerError, Result};

#[inline]
fn mul(a: usize, b: usize) -> Result<usize> {
  a.checked_mul(b).ok_or(IcerError::Overflow)
}

#[inline]
fn add(a: usize, b: usize) -> Result<usize> {
  a.checked_add(b).ok_or(IcerError::Overflow)
}

/// Grid cells of a partition in compression order: top region row-major,
/// then the bottom region. Yields `(row_origin, col_origin, seg_w, seg_h)`
/// in subband coordinates.
struct PartitionGrid<'a> {
  params: &'a PartitionParams,
  row: usize,
  col: usize,
  row_origin: usize,
  col_origin: usize,
  bottom: bool,
}

impl<'a> PartitionGrid<'a> {
  fn new(params: &'a PartitionParams) -> Self {
    Self {
      params,
      row: 0,
      col: 0,
      row_origin: 0,
      col_origin: 0,
      bottom: params.r_t == 0,
    }
  }

  fn region_dims(&self) -> (usize, usize, usize, usize, usize, usize) {
    let p = self.params;
    if self.bottom {
      (p.r - p.r_t, p.c + 1, p.y_b, p.r_b0, p.x_b, p.c_b0)
    } else {
      (p.r_t, p.c, p.y_t, p.r_t0, p.x_t, p.c_t0)
    }
  }
}

impl Iterator for PartitionGrid<'_> {
  type Item = (usize, usize, usize, usize);

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let (rows, cols, y_base, r0, x_base, c0) = self.region_dims();
      if self.row >= rows {
        if self.bottom {
          return None;
        }
        self.bottom = true;
        self.row = 0;
        self.col = 0;
        self.col_origin = 0;
        continue;
      }
      let seg_h = y_base + usize::from(self.row >= r0);
      let seg_w = x_base + usize::from(self.col >= c0);
      let item = (self.row_origin, self.col_origin, seg_w, seg_h);

      self.col += 1;
      self.col_origin += seg_w;
      if self.col >= cols {
        self.col = 0;
        self.col_origin = 0;
        self.row += 1;
        self.row_origin += seg_h;
      }
      return Some(item);
    }
  }
}

/// Compress every segment of one subband bitplane.
///
/// `file_offset` is the byte offset of the subband origin in the plane
/// file; rows stride `rowstride` samples. Completed segments are recorded
/// in `lane` (the 33 slots of this subband bitplane in the 5-D index).
pub fn compress_partition<Fl: StorageFile>(
  file: &mut Fl,
  file_offset: u64,
  params: &PartitionParams,
  rowstride: usize,
  pkt: &PacketContext,
  stream: &mut DataStream,
  circ: &mut [u16],
  lane: &mut [Option<SegmentHandle>],
) -> Result<()> {
  // Tile buffer sized for the largest segment of this partition, with a
  // one-sample border on every side.
  let mut max_w = params.x_t + 1;
  let mut max_h = params.y_t + 1;
  if params.x_b > 0 {
    max_w = max_w.max(params.x_b + 1);
  }
  if params.y_b > 0 {
    max_h = max_h.max(params.y_b + 1);
  }
  let padded_w = max_w + 2;
  let padded_h = max_h + 2;
  let mut tile = Vec::new();
  tile.try_reserve_exact(mul(padded_w, padded_h)?).map_err(|_| IcerError::OutOfMemory)?;
  tile.resize(padded_w * padded_h, 0u16);
  let mut row_bytes = vec![0u8; max_w * 2];

  for (segment_num, (row_origin, col_origin, seg_w, seg_h)) in PartitionGrid::new(params).enumerate() {
    debug_assert!(segment_num < lane.len());

    // Read the segment rows into the padded buffer, replicating the first
    // and last sample of each row into the side border.
    let sample_offset = add(mul(row_origin, rowstride)?, col_origin)?;
    let segment_start = add(file_offset as usize, mul(sample_offset, 2)?)?;
    for seg_row in 0..seg_h {
      let row_pos = add(segment_start, mul(mul(seg_row, rowstride)?, 2)?)?;
      let dst = (seg_row + 1) * padded_w + 1;
      file.read_exact_at(row_pos as u64, &mut row_bytes[..seg_w * 2])?;
      LittleEndian::read_u16_into(&row_bytes[..seg_w * 2], &mut tile[dst..dst + seg_w]);
      tile[dst - 1] = tile[dst];
      tile[dst + seg_w] = tile[dst + seg_w - 1];
    }
    // Replicate the first and last data rows, borders included, into the
    // top and bottom padding rows.
    tile.copy_within(padded_w..2 * padded_w, 0);
    let last_data = seg_h * padded_w;
    tile.copy_within(last_data..last_data + padded_w, (seg_h + 1) * padded_w);

    let mut model = ContextModel::new(pkt.subband_type);
    let handle = stream.allocate_segment(segment_num as u8, pkt)?;
    let max_bits = stream.payload_capacity_bits(handle);

    let result = {
      let payload = stream.payload_mut(handle);
      let mut coder = EntropyCoder::new(circ, payload, max_bits);
      compress_bitplane(&tile, padded_w + 1, seg_w, seg_h, padded_w, &mut model, &mut coder, pkt)
        .map(|()| coder.data_length_bits())
    };
    match result {
      Ok(bits) => {
        stream.finalize_segment(handle, bits as u32);
        lane[segment_num] = Some(handle);
      }
      Err(status) => {
        stream.rollback_segment(handle);
        return Err(IcerError::Kernel(status));
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::icer::{Channel, DataStream, Subband, generate_partition_params};
  use crate::icer::entropy::CIRC_BUF_SIZE;
  use crate::icer::{MAX_SEGMENTS, SEGMENT_HEADER_LEN, SegmentHeader};
  use crate::storage::{FileSystem, HostFileSystem};

  fn testfs(name: &str) -> HostFileSystem {
    let dir = std::env::temp_dir().join("icerstream-partition").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    HostFileSystem::new(dir).unwrap()
  }

  fn pkt(lsb: u8) -> PacketContext {
    PacketContext {
      subband_type: Subband::Hl,
      decomp_level: 1,
      lsb,
      ll_mean_val: 0,
      priority: 4,
      image_w: 64,
      image_h: 64,
      channel: Channel::Y,
    }
  }

  #[test]
  fn grid_matches_params() {
    crate::init_test_logger();
    let params = generate_partition_params(45, 34, 6).unwrap();
    let cells: Vec<_> = PartitionGrid::new(&params).collect();
    assert_eq!(cells.len(), params.s);
    // Cells tile the subband exactly: total area matches.
    let area: usize = cells.iter().map(|&(_, _, w, h)| w * h).sum();
    assert_eq!(area, 45 * 34);
    // First cell sits at the origin.
    assert_eq!((cells[0].0, cells[0].1), (0, 0));
  }

  #[test]
  fn compresses_a_strided_subband() -> Result<()> {
    crate::init_test_logger();
    let fs = testfs("strided");
    // A 64-wide plane holding a 32x32 subband at sample offset 32.
    let rowstride = 64usize;
    let (sub_w, sub_h) = (32usize, 32usize);
    let mut plane = vec![0u16; rowstride * sub_h];
    for r in 0..sub_h {
      for c in 0..sub_w {
        plane[r * rowstride + 32 + c] = ((r * 7 + c * 3) % 5 == 0) as u16;
      }
    }
    let mut bytes = vec![0u8; plane.len() * 2];
    LittleEndian::write_u16_into(&plane, &mut bytes);
    fs.open_write("plane.raw")?.write_all(&bytes)?;

    let params = generate_partition_params(sub_w, sub_h, 6).unwrap();
    let mut stream = DataStream::new(vec![0u8; 1 << 16], 1 << 16).unwrap();
    let mut circ = vec![0u16; CIRC_BUF_SIZE];
    let mut lane = vec![None; MAX_SEGMENTS + 1];
    let mut file = fs.open_read("plane.raw")?;
    compress_partition(&mut file, 64, &params, rowstride, &pkt(0), &mut stream, &mut circ, &mut lane)?;

    let live: Vec<_> = lane.iter().flatten().collect();
    assert_eq!(live.len(), params.s);
    for &&handle in &live {
      let bytes = stream.segment_bytes(handle);
      let header = SegmentHeader::read_from(bytes);
      assert_eq!(header.preamble, crate::icer::PACKET_PREAMBLE);
      assert_eq!(bytes.len(), SEGMENT_HEADER_LEN + (header.data_length as usize).div_ceil(8));
    }
    Ok(())
  }

  #[test]
  fn quota_exhaustion_rolls_back_and_reports() -> Result<()> {
    crate::init_test_logger();
    let fs = testfs("quota");
    let rowstride = 32usize;
    // Noisy data so the plane does not compress.
    let plane: Vec<u16> = (0..rowstride * 32).map(|i| ((i * 2654435761usize) >> 7) as u16 & 0x7FFF).collect();
    let mut bytes = vec![0u8; plane.len() * 2];
    LittleEndian::write_u16_into(&plane, &mut bytes);
    fs.open_write("plane.raw")?.write_all(&bytes)?;

    let params = generate_partition_params(32, 32, 4).unwrap();
    // Room for barely more than one header.
    let mut stream = DataStream::new(vec![0u8; 64], 40).unwrap();
    let mut circ = vec![0u16; CIRC_BUF_SIZE];
    let mut lane = vec![None; MAX_SEGMENTS + 1];
    let mut file = fs.open_read("plane.raw")?;
    let used_before = stream.size_used();
    let result = compress_partition(&mut file, 0, &params, rowstride, &pkt(3), &mut stream, &mut circ, &mut lane);
    assert!(matches!(result, Err(IcerError::Kernel(IcerStatus::ByteQuotaExceeded))));
    // The failed segment's header was rolled back and its slot left empty.
    assert_eq!(stream.size_used(), used_before);
    assert!(lane.iter().all(|s| s.is_none()));
    Ok(())
  }
}

// SPDX-License-Identifier: LGPL-2.1

//! The flash-streaming compression pipeline.
//!
//! [`compress_yuv_files`] drives stages B through F over three plane files:
//! streaming wavelet transform, LL-mean normalization and sign-magnitude
//! recode, priority-ordered partition compression into the datastream
//! arena, and the rearrange pass that emits segment records to the output
//! file in the wire-format order. Stage A lives in [`planes`].

use log::{debug, info, warn};

use crate::icer::{
  self, BITPLANES_TO_COMPRESS_16, CHANNELS, CIRC_BUF_SIZE, Channel, DataStream, FilterType, IcerStatus,
  MAX_DECOMP_STAGES, SUBBAND_MAX, SegmentIndex, Subband, dim_high, dim_low, generate_partition_params,
};
use crate::storage::{FileSystem, StorageFile, TempFileGuard};
use crate::{IcerError, Result};

pub mod jpeg;
pub mod normalize;
pub mod packets;
pub mod partition;
pub mod planes;
pub mod wavelet;

const Y_TRANSFORMED_FILE: &str = "_y_transformed.tmp";
const U_TRANSFORMED_FILE: &str = "_u_transformed.tmp";
const V_TRANSFORMED_FILE: &str = "_v_transformed.tmp";

/// Safety margin added on top of the byte quota when sizing the datastream
/// buffer.
const DATASTREAM_MARGIN: usize = 512;

/// Caller-supplied tuning for one frame.
#[derive(Debug, Clone)]
pub struct EncodeParams {
  pub width: usize,
  pub height: usize,
  /// Wavelet decomposition depth, 1..=6. Typical 3-5.
  pub stages: u8,
  pub filter: FilterType,
  /// Target segments per subband, 1..=32. Typical 6-10.
  pub segments: u8,
  /// Soft byte quota; 0 requests lossless.
  pub target_size: usize,
  /// The plane files already hold wavelet-domain data; skip stage B.
  pub pre_transformed: bool,
  /// Fixed datastream buffer size for constrained deployments. `None`
  /// allocates the full byte quota plus margin; a cap below the quota
  /// surfaces [`IcerError::QuotaExceeded`] instead of silently truncating.
  pub datastream_capacity: Option<usize>,
}

impl EncodeParams {
  pub fn new(width: usize, height: usize) -> Self {
    Self {
      width,
      height,
      stages: 4,
      filter: FilterType::A,
      segments: 6,
      target_size: 0,
      pre_transformed: false,
      datastream_capacity: None,
    }
  }
}

/// Input plane filenames for one frame.
#[derive(Debug, Clone, Copy)]
pub struct PlaneFiles<'a> {
  pub y: &'a str,
  pub u: &'a str,
  pub v: &'a str,
}

impl<'a> PlaneFiles<'a> {
  fn get(&self, chan: Channel) -> &'a str {
    match chan {
      Channel::Y => self.y,
      Channel::U => self.u,
      Channel::V => self.v,
    }
  }
}

/// Success record of one compressed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedFrame {
  pub filename: String,
  pub compressed_size: usize,
}

fn validate(params: &EncodeParams, planes: &PlaneFiles<'_>, output: &str) -> Result<()> {
  if planes.y.is_empty() || planes.u.is_empty() || planes.v.is_empty() || output.is_empty() {
    return Err(IcerError::InvalidInput("missing filename"));
  }
  if params.width == 0 || params.height == 0 {
    return Err(IcerError::InvalidInput("zero frame dimension"));
  }
  if params.width > u16::MAX as usize || params.height > u16::MAX as usize {
    return Err(IcerError::InvalidInput("frame dimension exceeds 16 bits"));
  }
  params
    .width
    .checked_mul(params.height)
    .and_then(|px| px.checked_mul(2))
    .ok_or(IcerError::Overflow)?;
  if params.stages == 0 || params.stages as usize > MAX_DECOMP_STAGES {
    return Err(IcerError::Kernel(IcerStatus::TooManyStages));
  }
  if params.segments == 0 || params.segments as usize > icer::MAX_SEGMENTS {
    return Err(IcerError::Kernel(IcerStatus::TooManySegments));
  }
  let stages = params.stages as usize;
  if dim_low(params.width, stages) < 3 || dim_low(params.height, stages) < 3 {
    return Err(IcerError::DimensionsTooSmall(params.stages));
  }
  Ok(())
}

/// Subband origin offset (bytes) and dimensions inside a transformed plane
/// file, rows striding the full image width.
fn subband_geometry(subband: Subband, level: usize, width: usize, height: usize) -> Result<(u64, usize, usize)> {
  let low_w = dim_low(width, level);
  let low_h = dim_low(height, level);
  let (offset_samples, w, h) = match subband {
    Subband::Ll => (0usize, low_w, low_h),
    Subband::Hl => (low_w, dim_high(width, level), low_h),
    Subband::Lh => (low_h.checked_mul(width).ok_or(IcerError::Overflow)?, low_w, dim_high(height, level)),
    Subband::Hh => (
      low_h
        .checked_mul(width)
        .and_then(|v| v.checked_add(low_w))
        .ok_or(IcerError::Overflow)?,
      dim_high(width, level),
      dim_high(height, level),
    ),
  };
  let offset = offset_samples.checked_mul(2).ok_or(IcerError::Overflow)? as u64;
  Ok((offset, w, h))
}

/// Compress three plane files into one ICER output file.
///
/// Unless `pre_transformed` is set, the planes are first wavelet
/// transformed into temp files which are removed before returning. On any
/// error every file created for this frame is deleted; when
/// `pre_transformed` is set the caller's plane files are normalized in
/// place and are never deleted.
pub fn compress_yuv_files<F: FileSystem>(
  fs: &F,
  planes: &PlaneFiles<'_>,
  output: &str,
  params: &EncodeParams,
) -> Result<CompressedFrame> {
  validate(params, planes, output)?;
  let (width, height) = (params.width, params.height);
  let stages = params.stages as usize;
  info!(
    "icer: compressing {}x{} frame, stages={} filter={:?} segments={} target={}",
    width, height, params.stages, params.filter, params.segments, params.target_size
  );

  let mut temp_guard = TempFileGuard::new(fs);
  let transformed = if params.pre_transformed {
    PlaneFiles {
      y: planes.y,
      u: planes.u,
      v: planes.v,
    }
  } else {
    temp_guard.push(Y_TRANSFORMED_FILE);
    temp_guard.push(U_TRANSFORMED_FILE);
    temp_guard.push(V_TRANSFORMED_FILE);
    PlaneFiles {
      y: Y_TRANSFORMED_FILE,
      u: U_TRANSFORMED_FILE,
      v: V_TRANSFORMED_FILE,
    }
  };

  let mut output_guard = TempFileGuard::new(fs);
  output_guard.push(output);

  // Stage B: streaming wavelet transform per channel.
  if !params.pre_transformed {
    for chan in Channel::ALL {
      debug!("icer: transforming channel {:?}", chan);
      wavelet::streaming_wavelet_transform(
        fs,
        planes.get(chan),
        transformed.get(chan),
        width,
        height,
        params.stages,
        params.filter,
      )?;
    }
  }

  // Stage C: LL means.
  let ll_w = dim_low(width, stages);
  let ll_h = dim_low(height, stages);
  let mut ll_mean = [0u16; CHANNELS];
  for chan in Channel::ALL {
    ll_mean[chan as usize] = normalize::ll_subband_mean(fs, transformed.get(chan), width, ll_w, ll_h)?;
    debug!("icer: channel {:?} LL mean {}", chan, ll_mean[chan as usize]);
  }

  // Stage D: mean subtraction, then sign-magnitude recode of the full
  // plane.
  for chan in Channel::ALL {
    let name = transformed.get(chan);
    normalize::subtract_ll_mean(fs, name, width, ll_w, ll_h, ll_mean[chan as usize])?;
    normalize::recode_sign_magnitude(fs, name, width, height)?;
  }

  // Byte quota: explicit target, or the raw frame size for lossless.
  let pixel_count = width * height;
  let byte_quota = if params.target_size == 0 {
    pixel_count.checked_mul(6).ok_or(IcerError::Overflow)?
  } else {
    params.target_size
  };
  let buffer_size = match params.datastream_capacity {
    Some(cap) => cap,
    None => byte_quota.checked_add(DATASTREAM_MARGIN).ok_or(IcerError::Overflow)?,
  };
  let effective_quota = byte_quota.min(buffer_size);
  let clamped = effective_quota < byte_quota;
  if clamped {
    warn!("icer: datastream buffer {} below byte quota {}", buffer_size, byte_quota);
  }

  // Stage F resources: arena, circular codeword buffer, 5-D index. All
  // acquired here and released when this function returns.
  let mut arena = Vec::new();
  arena.try_reserve_exact(buffer_size).map_err(|_| IcerError::OutOfMemory)?;
  arena.resize(buffer_size, 0u8);
  let mut stream = DataStream::new(arena, effective_quota)?;
  let mut circ = vec![0u16; CIRC_BUF_SIZE];
  let mut index = SegmentIndex::new();
  index.clear();

  // Stage E: packet list in priority order.
  let mut packet_list = packets::build_packet_list(width as u16, height as u16, params.stages, &ll_mean)?;
  packets::sort_packets(&mut packet_list);
  debug!("icer: {} packets queued", packet_list.len());

  // The output file is created up front; rearrange streams into it.
  fs.remove(output)?;
  let mut output_file = fs.open_write(output)?;

  // Stage F.4: per-packet partition compression.
  let mut quota_reached = false;
  for (it, pkt) in packet_list.iter().enumerate() {
    let (subband_offset, sub_w, sub_h) = subband_geometry(pkt.subband_type, pkt.decomp_level as usize, width, height)?;
    let partition_params = generate_partition_params(sub_w, sub_h, params.segments)?;
    let mut channel_file = fs.open_read(transformed.get(pkt.channel))?;
    let lane = index.lane_mut(
      pkt.channel as usize,
      pkt.decomp_level as usize,
      pkt.subband_type as usize,
      pkt.lsb as usize,
    );
    match partition::compress_partition(
      &mut channel_file,
      subband_offset,
      &partition_params,
      width,
      pkt,
      &mut stream,
      &mut circ,
      lane,
    ) {
      Ok(()) => {}
      Err(IcerError::Kernel(IcerStatus::ByteQuotaExceeded)) => {
        if clamped {
          return Err(IcerError::QuotaExceeded);
        }
        // Progressive truncation: every remaining packet has lower
        // priority. Keep what is already encoded.
        info!("icer: byte quota reached after {} of {} packets", it, packet_list.len());
        quota_reached = true;
        break;
      }
      Err(err) => return Err(err),
    }
  }
  if !quota_reached {
    debug!("icer: all {} packets compressed", packet_list.len());
  }

  // Stage F.5: rearrange. Emission order is the wire format; any
  // deviation breaks compatibility.
  let mut rearrange_offset = 0usize;
  let mut segments_written = 0usize;
  for k in 0..=icer::MAX_SEGMENTS {
    for j in (0..=SUBBAND_MAX).rev() {
      for i in (0..=MAX_DECOMP_STAGES).rev() {
        for lsb in (0..BITPLANES_TO_COMPRESS_16).rev() {
          for chan in Channel::ALL {
            if let Some(handle) = index.get(chan as usize, i, j, lsb, k) {
              stream.tag_channel(handle, chan);
              let record = stream.segment_bytes(handle);
              output_file.write_all(record)?;
              rearrange_offset += record.len();
              segments_written += 1;
            }
          }
        }
      }
    }
  }
  output_file.flush()?;
  drop(output_file);
  info!("icer: {} segments, {} bytes", segments_written, rearrange_offset);
  if segments_written == 0 {
    // Not even one segment fit the quota.
    return Err(IcerError::QuotaExceeded);
  }

  // Verify the finished output before claiming success.
  let actual = fs.open_read(output)?.size()? as usize;
  if actual != rearrange_offset {
    return Err(IcerError::Corrupted);
  }

  // Success: keep the output, still drop the transformed temps.
  output_guard.disarm();
  Ok(CompressedFrame {
    filename: output.to_string(),
    compressed_size: rearrange_offset,
  })
}

// SPDX-License-Identifier: LGPL-2.1

//! Small-memory streaming baseline JPEG decoder.
//!
//! Decodes baseline sequential 8-bit JPEG (1 or 3 components, sampling
//! factors 1-2, restart intervals) pulling compressed bytes from a storage
//! file and pushing one RGB888 rectangle per MCU to a caller callback. The
//! working set is the input ring, the Huffman and quantization tables and
//! one MCU of samples, never a full frame.
//!
//! Progressive, arithmetic and 12-bit streams are rejected.

use log::debug;

use crate::pumps::{BitPumpJpeg, ByteSource};
use crate::storage::StorageFile;
use crate::{IcerError, Result};

mod marker {
  pub const SOI: u8 = 0xD8;
  pub const EOI: u8 = 0xD9;
  pub const SOF0: u8 = 0xC0;
  pub const SOF1: u8 = 0xC1;
  pub const DHT: u8 = 0xC4;
  pub const DQT: u8 = 0xDB;
  pub const DRI: u8 = 0xDD;
  pub const SOS: u8 = 0xDA;
  pub const RST0: u8 = 0xD0;
  pub const APP0: u8 = 0xE0;
  pub const APP15: u8 = 0xEF;
  pub const COM: u8 = 0xFE;
}

/// Zigzag scan order to natural block order.
const ZIGZAG: [usize; 64] = [
  0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27, 20, 13, 6, 7, 14, 21,
  28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58, 59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54,
  47, 55, 62, 63,
];

/// 1-D IDCT basis, `0.5 * c(u) * cos((2x+1) u pi / 16)` in 1/2048 units.
const IDCT_TABLE: [[i32; 8]; 8] = build_idct_table();

const fn build_idct_table() -> [[i32; 8]; 8] {
  // 1024 * cos(k pi / 16) for k = 0..7.
  const COS: [i32; 8] = [1024, 1004, 946, 851, 724, 569, 392, 200];
  let mut tbl = [[0i32; 8]; 8];
  let mut u = 0;
  while u < 8 {
    let mut x = 0;
    while x < 8 {
      tbl[u][x] = if u == 0 {
        724 // 1024 / sqrt(2)
      } else {
        let a = ((2 * x + 1) * u) % 32;
        // cos(a pi / 16) by quadrant symmetry.
        if a == 8 || a == 24 {
          0
        } else if a < 8 {
          COS[a]
        } else if a < 24 {
          -COS[if a <= 16 { 16 - a } else { a - 16 }]
        } else {
          COS[32 - a]
        }
      };
      x += 1;
    }
    u += 1;
  }
  tbl
}

fn err(msg: impl Into<String>) -> IcerError {
  IcerError::DecodeFailed(msg.into())
}

#[derive(Debug, Clone)]
struct HuffTable {
  mincode: [i32; 17],
  maxcode: [i32; 17],
  valptr: [usize; 17],
  values: Vec<u8>,
}

impl HuffTable {
  /// Build the Annex-F decode tables from DHT code counts and values.
  fn new(counts: &[u8; 16], values: Vec<u8>) -> Result<HuffTable> {
    let total: usize = counts.iter().map(|&c| c as usize).sum();
    if total != values.len() || total > 256 {
      return Err(err("invalid Huffman table"));
    }
    let mut mincode = [0i32; 17];
    let mut maxcode = [-1i32; 17];
    let mut valptr = [0usize; 17];
    let mut code = 0i32;
    let mut k = 0usize;
    for len in 1..=16 {
      let n = counts[len - 1] as i32;
      if n > 0 {
        valptr[len] = k;
        mincode[len] = code;
        code += n;
        k += n as usize;
        maxcode[len] = code - 1;
      }
      code <<= 1;
    }
    Ok(HuffTable {
      mincode,
      maxcode,
      valptr,
      values,
    })
  }

  fn decode<F: StorageFile>(&self, pump: &mut BitPumpJpeg, src: &mut ByteSource<'_, F>) -> Result<u8> {
    let mut code = 0i32;
    for len in 1..=16 {
      code = (code << 1) | pump.get_bit(src)? as i32;
      if self.maxcode[len] >= 0 && code <= self.maxcode[len] {
        let idx = self.valptr[len] + (code - self.mincode[len]) as usize;
        return self.values.get(idx).copied().ok_or_else(|| err("corrupt Huffman code"));
      }
    }
    Err(err("invalid Huffman code"))
  }
}

#[derive(Debug, Clone, Copy)]
struct Component {
  id: u8,
  h: usize,
  v: usize,
  tq: usize,
  dc_tbl: usize,
  ac_tbl: usize,
  dc_pred: i32,
}

/// One decoded MCU rectangle, clipped to the image bounds.
#[derive(Debug, Clone, Copy)]
pub struct McuRect {
  pub left: usize,
  pub top: usize,
  pub width: usize,
  pub height: usize,
}

pub struct JpegDecoder<'a, F: StorageFile> {
  src: ByteSource<'a, F>,
  width: usize,
  height: usize,
  comps: Vec<Component>,
  qt: [[u16; 64]; 4],
  qt_present: [bool; 4],
  dc_tables: [Option<HuffTable>; 4],
  ac_tables: [Option<HuffTable>; 4],
  restart_interval: usize,
  hmax: usize,
  vmax: usize,
}

impl<'a, F: StorageFile> JpegDecoder<'a, F> {
  /// Parse markers up to and including SOS. After this the dimensions are
  /// known and [`Self::decompress`] may run.
  pub fn prepare(file: &'a mut F) -> Result<Self> {
    let mut dec = JpegDecoder {
      src: ByteSource::new(file),
      width: 0,
      height: 0,
      comps: Vec::new(),
      qt: [[0; 64]; 4],
      qt_present: [false; 4],
      dc_tables: [None, None, None, None],
      ac_tables: [None, None, None, None],
      restart_interval: 0,
      hmax: 0,
      vmax: 0,
    };

    if dec.src.read_u8()? != 0xFF || dec.src.read_u8()? != marker::SOI {
      return Err(err("missing SOI marker"));
    }
    loop {
      let m = dec.next_marker()?;
      match m {
        marker::SOF0 | marker::SOF1 => dec.parse_sof()?,
        0xC2..=0xCB if m != marker::DHT => {
          return Err(err(format!("unsupported JPEG coding process (SOF{})", m - marker::SOF0)));
        }
        marker::DHT => dec.parse_dht()?,
        marker::DQT => dec.parse_dqt()?,
        marker::DRI => dec.parse_dri()?,
        marker::APP0..=marker::APP15 | marker::COM => dec.skip_segment()?,
        marker::SOS => {
          dec.parse_sos()?;
          break;
        }
        marker::EOI => return Err(err("reached EOI before SOS")),
        other => return Err(err(format!("unexpected marker 0x{:02X}", other))),
      }
    }
    debug!("jpeg: {}x{} components: {}", dec.width, dec.height, dec.comps.len());
    Ok(dec)
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  fn next_marker(&mut self) -> Result<u8> {
    // Skip to the next 0xFF that introduces a real marker, tolerating fill
    // bytes.
    loop {
      let b = self.src.read_u8()?;
      if b != 0xFF {
        continue;
      }
      let m = self.src.read_u8()?;
      if m != 0x00 && m != 0xFF {
        return Ok(m);
      }
    }
  }

  fn segment_length(&mut self) -> Result<usize> {
    let len = self.src.read_u16be()? as usize;
    if len < 2 {
      return Err(err("invalid segment length"));
    }
    Ok(len - 2)
  }

  fn skip_segment(&mut self) -> Result<()> {
    let len = self.segment_length()?;
    self.src.skip(len)?;
    Ok(())
  }

  fn parse_sof(&mut self) -> Result<()> {
    if !self.comps.is_empty() {
      return Err(err("multiple SOF markers"));
    }
    let len = self.segment_length()?;
    let precision = self.src.read_u8()?;
    if precision != 8 {
      return Err(err(format!("unsupported sample precision {}", precision)));
    }
    self.height = self.src.read_u16be()? as usize;
    self.width = self.src.read_u16be()? as usize;
    let ncomp = self.src.read_u8()? as usize;
    if self.width == 0 || self.height == 0 {
      return Err(err("zero image dimension"));
    }
    if ncomp != 1 && ncomp != 3 {
      return Err(err(format!("unsupported component count {}", ncomp)));
    }
    if len != 6 + ncomp * 3 {
      return Err(err("SOF length mismatch"));
    }
    for _ in 0..ncomp {
      let id = self.src.read_u8()?;
      let hv = self.src.read_u8()?;
      let tq = self.src.read_u8()? as usize;
      let (h, v) = ((hv >> 4) as usize, (hv & 0xF) as usize);
      if !(1..=2).contains(&h) || !(1..=2).contains(&v) || tq > 3 {
        return Err(err("unsupported sampling factors"));
      }
      self.comps.push(Component {
        id,
        h,
        v,
        tq,
        dc_tbl: 0,
        ac_tbl: 0,
        dc_pred: 0,
      });
    }
    self.hmax = self.comps.iter().map(|c| c.h).max().unwrap_or(1);
    self.vmax = self.comps.iter().map(|c| c.v).max().unwrap_or(1);
    Ok(())
  }

  fn parse_dqt(&mut self) -> Result<()> {
    let mut len = self.segment_length()?;
    while len > 0 {
      let pq_tq = self.src.read_u8()?;
      let pq = pq_tq >> 4;
      let tq = (pq_tq & 0xF) as usize;
      if pq > 1 || tq > 3 {
        return Err(err("invalid DQT table"));
      }
      let entry_len = if pq == 0 { 64 } else { 128 };
      if len < 1 + entry_len {
        return Err(err("truncated DQT segment"));
      }
      for k in 0..64 {
        self.qt[tq][k] = if pq == 0 {
          u16::from(self.src.read_u8()?)
        } else {
          self.src.read_u16be()?
        };
      }
      self.qt_present[tq] = true;
      len -= 1 + entry_len;
    }
    Ok(())
  }

  fn parse_dht(&mut self) -> Result<()> {
    let mut len = self.segment_length()?;
    while len > 0 {
      let tc_th = self.src.read_u8()?;
      let tc = tc_th >> 4;
      let th = (tc_th & 0xF) as usize;
      if tc > 1 || th > 3 {
        return Err(err("invalid DHT table class or id"));
      }
      let mut counts = [0u8; 16];
      let mut total = 0usize;
      for c in counts.iter_mut() {
        *c = self.src.read_u8()?;
        total += *c as usize;
      }
      if len < 17 + total {
        return Err(err("truncated DHT segment"));
      }
      let mut values = vec![0u8; total];
      for v in values.iter_mut() {
        *v = self.src.read_u8()?;
      }
      let table = HuffTable::new(&counts, values)?;
      if tc == 0 {
        self.dc_tables[th] = Some(table);
      } else {
        self.ac_tables[th] = Some(table);
      }
      len -= 17 + total;
    }
    Ok(())
  }

  fn parse_dri(&mut self) -> Result<()> {
    if self.segment_length()? != 2 {
      return Err(err("invalid DRI segment"));
    }
    self.restart_interval = self.src.read_u16be()? as usize;
    Ok(())
  }

  fn parse_sos(&mut self) -> Result<()> {
    let len = self.segment_length()?;
    if self.comps.is_empty() {
      return Err(err("SOS before SOF"));
    }
    let ns = self.src.read_u8()? as usize;
    if ns != self.comps.len() || len != 4 + ns * 2 {
      return Err(err("SOS component mismatch"));
    }
    for _ in 0..ns {
      let cs = self.src.read_u8()?;
      let tbls = self.src.read_u8()?;
      let comp = self
        .comps
        .iter_mut()
        .find(|c| c.id == cs)
        .ok_or_else(|| err(format!("invalid component selector {}", cs)))?;
      comp.dc_tbl = (tbls >> 4) as usize;
      comp.ac_tbl = (tbls & 0xF) as usize;
      if comp.dc_tbl > 3 || comp.ac_tbl > 3 {
        return Err(err("invalid Huffman table selection"));
      }
    }
    // Ss, Se, Ah/Al are fixed for baseline.
    self.src.skip(3)?;
    for comp in &self.comps {
      if !self.qt_present[comp.tq] {
        return Err(err("missing quantization table"));
      }
      if self.dc_tables[comp.dc_tbl].is_none() || self.ac_tables[comp.ac_tbl].is_none() {
        return Err(err("missing Huffman table"));
      }
    }
    Ok(())
  }

  /// Decode the scan, invoking `out` once per MCU with the clipped
  /// rectangle and its packed RGB888 samples.
  pub fn decompress(mut self, out: &mut dyn FnMut(&McuRect, &[u8]) -> Result<()>) -> Result<()> {
    let mcu_w = 8 * self.hmax;
    let mcu_h = 8 * self.vmax;
    let mcus_x = self.width.div_ceil(mcu_w);
    let mcus_y = self.height.div_ceil(mcu_h);

    // Per-component MCU sample planes plus the packed RGB rectangle.
    let mut samples: Vec<Vec<u8>> = self.comps.iter().map(|c| vec![0u8; c.h * 8 * c.v * 8]).collect();
    let mut rgb = vec![0u8; mcu_w * mcu_h * 3];
    let mut coefs = [0i32; 64];

    let mut pump = BitPumpJpeg::new();
    let mut restart_count = 0u8;
    let mut mcus_done = 0usize;

    for my in 0..mcus_y {
      for mx in 0..mcus_x {
        if self.restart_interval > 0 && mcus_done > 0 && mcus_done % self.restart_interval == 0 {
          self.sync_restart(&mut pump, restart_count)?;
          restart_count = (restart_count + 1) % 8;
        }

        for ci in 0..self.comps.len() {
          let comp = self.comps[ci];
          for by in 0..comp.v {
            for bx in 0..comp.h {
              let pred = self.decode_block(&mut pump, ci, &mut coefs)?;
              self.comps[ci].dc_pred = pred;
              let plane_stride = comp.h * 8;
              idct_block(&coefs, &mut samples[ci], by * 8 * plane_stride + bx * 8, plane_stride);
            }
          }
        }

        let rect = McuRect {
          left: mx * mcu_w,
          top: my * mcu_h,
          width: mcu_w.min(self.width - mx * mcu_w),
          height: mcu_h.min(self.height - my * mcu_h),
        };
        self.fill_rgb(&samples, &rect, &mut rgb);
        out(&rect, &rgb[..rect.width * rect.height * 3])?;
        mcus_done += 1;
      }
    }
    debug!("jpeg: decoded {} MCUs", mcus_done);
    Ok(())
  }

  fn sync_restart(&mut self, pump: &mut BitPumpJpeg, expected: u8) -> Result<()> {
    let m = match pump.restart() {
      Some(m) => m,
      None => self.next_marker()?,
    };
    if m != marker::RST0 + expected {
      return Err(err(format!("restart marker mismatch: got 0x{:02X}", m)));
    }
    for comp in self.comps.iter_mut() {
      comp.dc_pred = 0;
    }
    Ok(())
  }

  /// Decode and dequantize one block into natural order. Returns the new
  /// DC predictor for the component.
  fn decode_block(&mut self, pump: &mut BitPumpJpeg, ci: usize, coefs: &mut [i32; 64]) -> Result<i32> {
    coefs.fill(0);
    let comp = self.comps[ci];
    let qt = &self.qt[comp.tq];
    let dc_tbl = self.dc_tables[comp.dc_tbl].as_ref().ok_or_else(|| err("missing DC table"))?;
    let ac_tbl = self.ac_tables[comp.ac_tbl].as_ref().ok_or_else(|| err("missing AC table"))?;

    let t = dc_tbl.decode(pump, &mut self.src)? as u32;
    if t > 11 {
      return Err(err("invalid DC category"));
    }
    let diff = if t == 0 {
      0
    } else {
      extend(pump.get_bits(&mut self.src, t)? as i32, t)
    };
    let pred = comp.dc_pred + diff;
    coefs[0] = pred * qt[0] as i32;

    let mut k = 1usize;
    while k < 64 {
      let rs = ac_tbl.decode(pump, &mut self.src)?;
      let r = (rs >> 4) as usize;
      let s = (rs & 0xF) as u32;
      if s == 0 {
        if r == 15 {
          k += 16;
          continue;
        }
        break; // EOB
      }
      k += r;
      if k > 63 || s > 10 {
        return Err(err("corrupt AC coefficients"));
      }
      let v = extend(pump.get_bits(&mut self.src, s)? as i32, s);
      coefs[ZIGZAG[k]] = v * qt[k] as i32;
      k += 1;
    }
    Ok(pred)
  }

  /// Upsample and color-convert the component planes into a packed RGB888
  /// rectangle.
  fn fill_rgb(&self, samples: &[Vec<u8>], rect: &McuRect, rgb: &mut [u8]) {
    let gray = self.comps.len() == 1;
    for y in 0..rect.height {
      for x in 0..rect.width {
        let sample = |ci: usize| -> i32 {
          let comp = &self.comps[ci];
          let sx = x * comp.h / self.hmax;
          let sy = y * comp.v / self.vmax;
          samples[ci][sy * comp.h * 8 + sx] as i32
        };
        let out = &mut rgb[(y * rect.width + x) * 3..(y * rect.width + x) * 3 + 3];
        if gray {
          let l = sample(0) as u8;
          out.copy_from_slice(&[l, l, l]);
        } else {
          let l = sample(0);
          let cb = sample(1) - 128;
          let cr = sample(2) - 128;
          out[0] = clamp_u8(l + ((91881 * cr) >> 16));
          out[1] = clamp_u8(l - ((22554 * cb + 46802 * cr) >> 16));
          out[2] = clamp_u8(l + ((116130 * cb) >> 16));
        }
      }
    }
  }
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
  v.clamp(0, 255) as u8
}

/// JPEG magnitude extension (Annex F.2.2.1).
#[inline]
fn extend(v: i32, s: u32) -> i32 {
  if v < (1 << (s - 1)) { v - (1 << s) + 1 } else { v }
}

/// Two-pass integer IDCT with level shift, writing clamped samples at
/// `origin` with the given row stride.
fn idct_block(coefs: &[i32; 64], out: &mut [u8], origin: usize, stride: usize) {
  let mut tmp = [0i32; 64];
  // Columns first.
  for x in 0..8 {
    for y in 0..8 {
      let mut acc = 0i32;
      for v in 0..8 {
        acc += coefs[v * 8 + x] * IDCT_TABLE[v][y];
      }
      tmp[y * 8 + x] = (acc + (1 << 10)) >> 11;
    }
  }
  // Then rows.
  for y in 0..8 {
    for x in 0..8 {
      let mut acc = 0i32;
      for u in 0..8 {
        acc += tmp[y * 8 + u] * IDCT_TABLE[u][x];
      }
      let v = ((acc + (1 << 10)) >> 11) + 128;
      out[origin + y * stride + x] = clamp_u8(v);
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::storage::{FileSystem, HostFileSystem};

  fn jpeg_file(name: &str, data: &[u8]) -> (HostFileSystem, String) {
    let dir = std::env::temp_dir().join("icerstream-jpeg").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    let fs = HostFileSystem::new(dir).unwrap();
    let mut f = fs.open_write("in.jpg").unwrap();
    f.write_all(data).unwrap();
    (fs, "in.jpg".to_string())
  }

  /// Minimal valid 8x8 grayscale baseline JPEG: flat quantization, one-code
  /// Huffman tables, a single block with DC diff 0 and an immediate EOB.
  pub(crate) fn tiny_gray_jpeg() -> Vec<u8> {
    let mut j = Vec::new();
    j.extend_from_slice(&[0xFF, 0xD8]); // SOI
    // DQT: table 0, all ones.
    j.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
    j.extend_from_slice(&[1u8; 64]);
    // SOF0: 8 bit, 8x8, 1 component, no subsampling.
    j.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x00, 0x08, 0x00, 0x08, 0x01, 0x01, 0x11, 0x00]);
    // DHT DC table 0: a single 1-bit code for category 0.
    j.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x14, 0x00]);
    j.push(1);
    j.extend_from_slice(&[0u8; 15]);
    j.push(0x00);
    // DHT AC table 0: a single 1-bit code for EOB.
    j.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x14, 0x10]);
    j.push(1);
    j.extend_from_slice(&[0u8; 15]);
    j.push(0x00);
    // SOS, then one entropy byte: bit 0 = DC cat 0, bit 0 = EOB, padded.
    j.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
    j.push(0x00);
    j.extend_from_slice(&[0xFF, 0xD9]); // EOI
    j
  }

  #[test]
  fn decodes_tiny_gray_block() -> crate::Result<()> {
    crate::init_test_logger();
    let (fs, name) = jpeg_file("tiny", &tiny_gray_jpeg());
    let mut file = fs.open_read(&name)?;
    let dec = JpegDecoder::prepare(&mut file)?;
    assert_eq!((dec.width(), dec.height()), (8, 8));
    let mut rects = 0;
    dec.decompress(&mut |rect, rgb| {
      assert_eq!((rect.left, rect.top, rect.width, rect.height), (0, 0, 8, 8));
      assert_eq!(rgb.len(), 8 * 8 * 3);
      // All-zero coefficients decode to mid-gray after the level shift.
      assert!(rgb.iter().all(|&v| v == 128));
      rects += 1;
      Ok(())
    })?;
    assert_eq!(rects, 1);
    Ok(())
  }

  #[test]
  fn rejects_progressive() {
    crate::init_test_logger();
    let mut data = tiny_gray_jpeg();
    // Flip SOF0 to SOF2.
    let pos = data.windows(2).position(|w| w == [0xFF, 0xC0]).unwrap();
    data[pos + 1] = 0xC2;
    let (fs, name) = jpeg_file("progressive", &data);
    let mut file = fs.open_read(&name).unwrap();
    assert!(matches!(JpegDecoder::prepare(&mut file), Err(IcerError::DecodeFailed(_))));
  }

  #[test]
  fn rejects_garbage() {
    crate::init_test_logger();
    let (fs, name) = jpeg_file("garbage", &[0x00, 0x11, 0x22, 0x33]);
    let mut file = fs.open_read(&name).unwrap();
    assert!(JpegDecoder::prepare(&mut file).is_err());
  }

  #[test]
  fn idct_dc_only_is_flat() {
    crate::init_test_logger();
    let mut coefs = [0i32; 64];
    coefs[0] = 256; // DC 256 -> 32 above mid-gray after normalization
    let mut out = vec![0u8; 64];
    idct_block(&coefs, &mut out, 0, 8);
    let first = out[0];
    assert!(out.iter().all(|&v| v == first));
    assert!(first > 128);
  }
}

// SPDX-License-Identifier: LGPL-2.1

//! Packet list construction and priority ordering.
//!
//! One packet per subband bitplane per channel per stage, plus the LL
//! packets of the deepest stage. The priority accumulator is shared across
//! the loop and doubles at every (bitplane, Y) step, so the three channels
//! of one step carry the same value; HL and LH tie, HH trails at half
//! priority plus one. The decoder depends on this schedule; do not tidy it.

use crate::icer::{
  BITPLANES_TO_COMPRESS_16, Channel, MAX_PACKETS_16, PacketContext, Subband,
};
use crate::{IcerError, Result};

/// Build the unsorted packet list for a `width x height` frame.
pub fn build_packet_list(width: u16, height: u16, stages: u8, ll_mean: &[u16; 3]) -> Result<Vec<PacketContext>> {
  let mut packets: Vec<PacketContext> = Vec::with_capacity(MAX_PACKETS_16);

  let push = |packets: &mut Vec<PacketContext>, pkt: PacketContext| -> Result<()> {
    if packets.len() >= MAX_PACKETS_16 {
      return Err(IcerError::PacketLimitExceeded);
    }
    packets.push(pkt);
    Ok(())
  };

  for curr_stage in 1..=stages {
    let mut priority: u64 = 1 << curr_stage;
    for lsb in 0..BITPLANES_TO_COMPRESS_16 as u8 {
      for chan in Channel::ALL {
        if chan == Channel::Y {
          priority *= 2;
        }
        for (subband, prio) in [
          (Subband::Hl, priority << lsb),
          (Subband::Lh, priority << lsb),
          (Subband::Hh, ((priority / 2) << lsb) + 1),
        ] {
          push(
            &mut packets,
            PacketContext {
              subband_type: subband,
              decomp_level: curr_stage,
              lsb,
              ll_mean_val: ll_mean[chan as usize],
              priority: prio,
              image_w: width,
              image_h: height,
              channel: chan,
            },
          )?;
        }
      }
    }
  }

  // LL packets of the deepest decomposition level.
  let mut priority: u64 = 1 << stages;
  for lsb in 0..BITPLANES_TO_COMPRESS_16 as u8 {
    for chan in Channel::ALL {
      if chan == Channel::Y {
        priority *= 2;
      }
      push(
        &mut packets,
        PacketContext {
          subband_type: Subband::Ll,
          decomp_level: stages,
          lsb,
          ll_mean_val: ll_mean[chan as usize],
          priority: (2 * priority) << lsb,
          image_w: width,
          image_h: height,
          channel: chan,
        },
      )?;
    }
  }

  Ok(packets)
}

/// Order packets for compression: higher priority first, higher subband
/// ordinal breaking ties. Further ties keep insertion order.
pub fn sort_packets(packets: &mut [PacketContext]) {
  packets.sort_by(|a, b| {
    b.priority
      .cmp(&a.priority)
      .then_with(|| (b.subband_type as u8).cmp(&(a.subband_type as u8)))
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn packet_count_matches_geometry() -> Result<()> {
    crate::init_test_logger();
    for stages in 1..=5u8 {
      let packets = build_packet_list(320, 240, stages, &[100, 128, 128])?;
      let expected = stages as usize * BITPLANES_TO_COMPRESS_16 * 3 * 3 + BITPLANES_TO_COMPRESS_16 * 3;
      assert_eq!(packets.len(), expected);
    }
    Ok(())
  }

  #[test]
  fn six_stages_exceed_the_packet_limit() {
    crate::init_test_logger();
    // 6 * 15 * 9 + 45 = 855 > 800.
    assert!(matches!(
      build_packet_list(320, 240, 6, &[0, 0, 0]),
      Err(IcerError::PacketLimitExceeded)
    ));
  }

  #[test]
  fn channels_of_one_step_share_priority() -> Result<()> {
    crate::init_test_logger();
    let packets = build_packet_list(64, 64, 2, &[0, 0, 0])?;
    // The first nine packets are stage 1, lsb 0: HL/LH/HH for Y, U, V.
    let hl: Vec<_> = packets.iter().take(9).filter(|p| p.subband_type == Subband::Hl).collect();
    assert_eq!(hl.len(), 3);
    assert!(hl.iter().all(|p| p.priority == hl[0].priority));
    // The accumulator doubled once for the Y step: 2^stage * 2.
    assert_eq!(hl[0].priority, 4);
    Ok(())
  }

  #[test]
  fn hh_trails_its_step() -> Result<()> {
    crate::init_test_logger();
    let packets = build_packet_list(64, 64, 1, &[0, 0, 0])?;
    let hl = packets[0].priority;
    let hh = packets[2].priority;
    assert_eq!(packets[2].subband_type, Subband::Hh);
    assert_eq!(hh, (hl / 2) + 1);
    Ok(())
  }

  #[test]
  fn deep_bitplanes_do_not_wrap() -> Result<()> {
    crate::init_test_logger();
    let packets = build_packet_list(1280, 960, 5, &[0, 0, 0])?;
    let max = packets.iter().map(|p| p.priority).max().unwrap();
    assert!(max > u64::from(u32::MAX), "deep priorities need the u64 domain");
    Ok(())
  }

  #[test]
  fn sort_is_stable_and_keyed() -> Result<()> {
    crate::init_test_logger();
    let mut packets = build_packet_list(320, 240, 4, &[10, 20, 30])?;
    sort_packets(&mut packets);
    for pair in packets.windows(2) {
      let (a, b) = (&pair[0], &pair[1]);
      assert!(
        a.priority > b.priority || (a.priority == b.priority && a.subband_type as u8 >= b.subband_type as u8),
        "sort order violated: {:?} before {:?}",
        a,
        b
      );
    }
    // Highest priority first: the deepest LL bitplane of the Y channel.
    assert_eq!(packets[0].subband_type, Subband::Ll);
    assert_eq!(packets[0].lsb, BITPLANES_TO_COMPRESS_16 as u8 - 1);
    Ok(())
  }
}

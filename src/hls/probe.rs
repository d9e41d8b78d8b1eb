//! §4.5.4 — initial PTS probing: a ranged fetch of the first segment's leading bytes, used to
//! anchor a stream's first segment to presentation time 0.
//!
//! No teacher analogue (the teacher never inspects container internals — it hands bytes straight
//! to ffmpeg/libav for muxing). Grounded on the box-walking style implied by the teacher's own
//! comments about ISO-BMFF/CMAF containers in `lib.rs`'s module doc, using `byteorder` (a teacher
//! dependency, otherwise unused once `fetch.rs`/`media.rs` were removed) for big-endian field
//! reads, the way the pack's other container-parsing code reads box headers.

use crate::error::{ManifestError, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

/// Walks a sequence of ISO-BMFF boxes looking for `path`, e.g. `["moof", "traf", "tfdt"]`,
/// returning the payload bytes of the first match at any depth matching the path.
fn find_box<'a>(data: &'a [u8], path: &[&str]) -> Option<&'a [u8]> {
    let mut cursor = Cursor::new(data);
    let Some((want, rest)) = path.split_first() else { return Some(data) };
    while (cursor.position() as usize) < data.len() {
        let box_start = cursor.position() as usize;
        let size = cursor.read_u32::<BigEndian>().ok()? as usize;
        let mut kind = [0u8; 4];
        cursor.read_exact(&mut kind).ok()?;
        let kind = std::str::from_utf8(&kind).ok()?;
        let (header_len, box_size) = if size == 1 {
            let large = cursor.read_u64::<BigEndian>().ok()? as usize;
            (16, large)
        } else if size == 0 {
            (8, data.len() - box_start)
        } else {
            (8, size)
        };
        let box_end = box_start + box_size;
        if box_end > data.len() || box_size < header_len {
            return None;
        }
        let payload = &data[box_start + header_len..box_end];
        if kind == *want {
            return find_box(payload, rest);
        }
        cursor.seek(SeekFrom::Start(box_end as u64)).ok()?;
    }
    None
}

/// Reads `moov/trak/mdia/mdhd`'s timescale. Handles both the version-0 (32-bit) and version-1
/// (64-bit) field layouts.
pub fn read_mdhd_timescale(init_segment: &[u8]) -> Result<u32> {
    let mdhd = find_box(init_segment, &["moov", "trak", "mdia", "mdhd"])
        .ok_or_else(|| ManifestError::manifest_malformed("no mdhd box found in init segment"))?;
    let version = mdhd[0];
    let mut cursor = Cursor::new(&mdhd[4..]);
    let timescale = if version == 1 {
        cursor.read_u64::<BigEndian>().map_err(ManifestError::from)?; // creation_time
        cursor.read_u64::<BigEndian>().map_err(ManifestError::from)?; // modification_time
        cursor.read_u32::<BigEndian>().map_err(ManifestError::from)?
    } else {
        cursor.read_u32::<BigEndian>().map_err(ManifestError::from)?; // creation_time
        cursor.read_u32::<BigEndian>().map_err(ManifestError::from)?; // modification_time
        cursor.read_u32::<BigEndian>().map_err(ManifestError::from)?
    };
    Ok(timescale)
}

/// Reads `moof/traf/tfdt`'s `baseMediaDecodeTime`, returning it alongside the timescale needed to
/// convert it to seconds (the caller supplies the timescale from the init segment's `mdhd`).
pub fn read_tfdt_base_media_decode_time(segment_bytes: &[u8]) -> Result<u64> {
    let tfdt = find_box(segment_bytes, &["moof", "traf", "tfdt"])
        .ok_or_else(|| ManifestError::manifest_malformed("no tfdt box found in segment"))?;
    let version = tfdt[0];
    let mut cursor = Cursor::new(&tfdt[4..]);
    if version == 1 {
        cursor.read_u64::<BigEndian>().map_err(ManifestError::from)
    } else {
        cursor.read_u32::<BigEndian>().map(u64::from).map_err(ManifestError::from)
    }
}

/// §4.5.4: "For fMP4 containers... The resulting value is the stream's `presentationTimeOffset`."
pub fn probe_fmp4_initial_pts(init_segment: &[u8], first_segment: &[u8]) -> Result<f64> {
    let timescale = read_mdhd_timescale(init_segment)?;
    let base_media_decode_time = read_tfdt_base_media_decode_time(first_segment)?;
    if timescale == 0 {
        return Err(ManifestError::manifest_malformed("mdhd timescale is zero"));
    }
    Ok(base_media_decode_time as f64 / timescale as f64)
}

const TS_PACKET_LEN: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

/// §4.5.4: "For MPEG-TS, locate a PES packet on the first PID with PTS flag set, extract the
/// 33-bit PTS, divide by 90 000."
pub fn probe_ts_initial_pts(data: &[u8]) -> Result<f64> {
    let mut offset = 0;
    let mut target_pid: Option<u16> = None;
    while offset + TS_PACKET_LEN <= data.len() {
        let packet = &data[offset..offset + TS_PACKET_LEN];
        offset += TS_PACKET_LEN;
        if packet[0] != TS_SYNC_BYTE {
            continue;
        }
        let pusi = (packet[1] & 0x40) != 0;
        let pid = (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16;
        if pid == 0x1FFF || pid < 0x10 {
            continue; // null packet or reserved/PSI range
        }
        if !pusi {
            continue;
        }
        if let Some(t) = target_pid {
            if pid != t {
                continue;
            }
        }
        let adaptation_field_control = (packet[3] >> 4) & 0x3;
        let mut payload_start = 4;
        if adaptation_field_control == 2 {
            continue; // adaptation field only, no payload
        }
        if adaptation_field_control == 3 {
            let adaptation_len = packet[4] as usize;
            payload_start += 1 + adaptation_len;
        }
        if payload_start + 14 > TS_PACKET_LEN {
            continue;
        }
        let payload = &packet[payload_start..];
        // PES start code prefix 0x000001
        if payload[0] != 0x00 || payload[1] != 0x00 || payload[2] != 0x01 {
            continue;
        }
        let pts_dts_flags = (payload[7] >> 6) & 0x3;
        if pts_dts_flags == 0 {
            target_pid.get_or_insert(pid);
            continue;
        }
        let pts_bytes = &payload[9..14];
        let pts = decode_pts(pts_bytes);
        return Ok(pts as f64 / 90_000.0);
    }
    Err(ManifestError::manifest_malformed("no PES packet with a PTS flag found in TS segment"))
}

fn decode_pts(b: &[u8]) -> u64 {
    let pts_32_30 = ((b[0] as u64) >> 1) & 0x07;
    let pts_29_15 = (((b[1] as u64) << 8) | b[2] as u64) >> 1;
    let pts_14_0 = (((b[3] as u64) << 8) | b[4] as u64) >> 1;
    (pts_32_30 << 30) | (pts_29_15 << 15) | pts_14_0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn reads_mdhd_v0_timescale() {
        let mut mdhd_payload = vec![0u8]; // version
        mdhd_payload.extend_from_slice(&[0, 0, 0]); // flags
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        mdhd_payload.extend_from_slice(&90000u32.to_be_bytes()); // timescale
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // duration
        let mdhd = make_box(b"mdhd", &mdhd_payload);
        let mdia = make_box(b"mdia", &mdhd);
        let trak = make_box(b"trak", &mdia);
        let moov = make_box(b"moov", &trak);

        assert_eq!(read_mdhd_timescale(&moov).unwrap(), 90000);
    }

    #[test]
    fn reads_tfdt_v1_base_media_decode_time() {
        let mut tfdt_payload = vec![1u8, 0, 0, 0]; // version 1, flags
        tfdt_payload.extend_from_slice(&123456789u64.to_be_bytes());
        let tfdt = make_box(b"tfdt", &tfdt_payload);
        let traf = make_box(b"traf", &tfdt);
        let moof = make_box(b"moof", &traf);

        assert_eq!(read_tfdt_base_media_decode_time(&moof).unwrap(), 123456789);
    }

    #[test]
    fn decode_pts_matches_known_value() {
        // 90000 * 5 = 450000 => PTS ticks at 5s
        let pts_value: u64 = 450_000;
        let b0 = 0x21 | (((pts_value >> 30) & 0x07) << 1) as u8;
        let b1_2 = (((pts_value >> 15) & 0x7FFF) << 1) | 1;
        let b3_4 = ((pts_value & 0x7FFF) << 1) | 1;
        let bytes = [
            b0,
            (b1_2 >> 8) as u8,
            (b1_2 & 0xFF) as u8,
            (b3_4 >> 8) as u8,
            (b3_4 & 0xFF) as u8,
        ];
        assert_eq!(decode_pts(&bytes), pts_value);
    }
}

//! RTCP compound packet parsing (`spec.md` §3, §6).
//!
//! Only the packet kinds the packet-transport/recovery engine consumes are
//! modeled: receiver reports, source descriptions (CNAME item only),
//! goodbye, transport-layer NACK (RFC4585, PT 205 FMT 1), congestion-control
//! feedback (RFC8888-shaped, PT 205 FMT 11), and two proprietary
//! payload-specific clock-sync formats (PT 206, FMT 29/30). Everything else
//! round-trips as [`RtcpPacket::Unknown`].

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::{smallvec, SmallVec};

use crate::Error;

/// Ticks-per-second resolution of the CCFB arrival-time-offset field
/// (`spec.md` §6, RFC 8888's ATO field).
const ATO_TICKS_PER_SECOND: f64 = 1024.0;
/// 13-bit field: ticks in `[0, 2^13)`.
const ATO_MAX_TICKS: u32 = (1 << 13) - 1;

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;
pub const PT_SOURCE_DESCRIPTION: u8 = 202;
pub const PT_GOODBYE: u8 = 203;
pub const PT_TRANSPORT_FEEDBACK: u8 = 205;
pub const PT_PAYLOAD_SPECIFIC: u8 = 206;

pub const FMT_NACK: u8 = 1;
pub const FMT_CCFB: u8 = 11;
pub const FMT_SENDER_CLOCK: u8 = 29;
pub const FMT_RECEIVER_CLOCK: u8 = 30;

const SDES_CNAME: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: i32,
    pub highest_sequence: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcfbEntry {
    pub sequence: u16,
    pub received: bool,
    pub ecn_marked: bool,
    /// How long before the report's `report_timestamp` this packet arrived
    /// (RFC 8888 Arrival Time Offset). Meaningless when `!received`.
    pub arrival_offset: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcfbSsrcReport {
    pub ssrc: u32,
    pub base_sequence: u16,
    pub entries: Vec<CcfbEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    ReceiverReport {
        sender_ssrc: u32,
        reports: SmallVec<[ReportBlock; 4]>,
    },
    SourceDescription {
        /// `(ssrc, cname)` pairs; only the CNAME item is retained per
        /// `spec.md` §3.
        chunks: SmallVec<[(u32, String); 4]>,
    },
    Goodbye {
        sources: SmallVec<[u32; 4]>,
    },
    TransportLayerNack {
        sender_ssrc: u32,
        media_ssrc: u32,
        /// Raw (pid, blp) pairs as they appeared on the wire.
        pairs: Vec<(u16, u16)>,
    },
    Ccfb {
        sender_ssrc: u32,
        /// Report timestamp, encoded as an NTP-format 32-bit value (middle
        /// 32 bits of a full 64-bit NTP timestamp) per RFC 8888.
        report_timestamp: u32,
        reports: Vec<CcfbSsrcReport>,
    },
    SenderClock {
        sender_ssrc: u32,
        ntp_time: u64,
    },
    ReceiverClock {
        sender_ssrc: u32,
        last_sender_ntp: u64,
        delay_since_receive: u32,
    },
    Unknown {
        packet_type: u8,
        fmt_or_count: u8,
        payload: Bytes,
    },
}

impl RtcpPacket {
    /// SSRCs this packet names as the subject/destination of its contents;
    /// used by the SSRC Return Manager (`spec.md` §4.G) to route outbound
    /// RTCP to the correct remote address for each destination SSRC found
    /// in an inbound compound.
    pub fn destination_ssrcs(&self) -> SmallVec<[u32; 4]> {
        match self {
            RtcpPacket::ReceiverReport { reports, .. } => {
                reports.iter().map(|r| r.ssrc).collect()
            }
            RtcpPacket::SourceDescription { chunks } => {
                chunks.iter().map(|(ssrc, _)| *ssrc).collect()
            }
            RtcpPacket::Goodbye { sources } => sources.clone(),
            RtcpPacket::TransportLayerNack { media_ssrc, .. } => smallvec![*media_ssrc],
            RtcpPacket::Ccfb { reports, .. } => reports.iter().map(|r| r.ssrc).collect(),
            RtcpPacket::SenderClock { sender_ssrc, .. } => smallvec![*sender_ssrc],
            RtcpPacket::ReceiverClock { sender_ssrc, .. } => smallvec![*sender_ssrc],
            RtcpPacket::Unknown { .. } => SmallVec::new(),
        }
    }
}

/// Decodes every RTCP packet in a compound datagram.
///
/// # Examples
///
/// ```
/// use rtp_proto::rtcp::{decode_compound, RtcpPacket};
///
/// let mut buf = bytes::BytesMut::new();
/// rtp_proto::rtcp::encode_goodbye(&mut buf, &[1, 2, 3]);
///
/// let compound = decode_compound(buf.freeze()).unwrap();
/// assert!(matches!(compound[0], RtcpPacket::Goodbye { .. }));
/// ```
pub fn decode_compound(mut bytes: Bytes) -> Result<Vec<RtcpPacket>, Error> {
    let mut packets = Vec::new();

    while bytes.len() >= 4 {
        let b0 = bytes[0];
        let version = b0 >> 6;
        if version != 2 {
            return Err(Error::InvalidInput);
        }

        let count_or_fmt = b0 & 0x1F;
        let packet_type = bytes[1];
        let length_words = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        let total_len = (length_words + 1) * 4;

        if bytes.len() < total_len {
            return Err(Error::InvalidInput);
        }

        let mut packet_bytes = bytes.split_to(total_len);
        packet_bytes.advance(4);

        packets.push(decode_single(packet_type, count_or_fmt, packet_bytes)?);
    }

    Ok(packets)
}

fn decode_single(packet_type: u8, count_or_fmt: u8, body: Bytes) -> Result<RtcpPacket, Error> {
    match packet_type {
        PT_RECEIVER_REPORT => decode_receiver_report(body),
        PT_SOURCE_DESCRIPTION => decode_sdes(body, count_or_fmt),
        PT_GOODBYE => decode_goodbye(body, count_or_fmt),
        PT_TRANSPORT_FEEDBACK if count_or_fmt == FMT_NACK => decode_nack(body),
        PT_TRANSPORT_FEEDBACK if count_or_fmt == FMT_CCFB => decode_ccfb(body),
        PT_PAYLOAD_SPECIFIC if count_or_fmt == FMT_SENDER_CLOCK => decode_sender_clock(body),
        PT_PAYLOAD_SPECIFIC if count_or_fmt == FMT_RECEIVER_CLOCK => decode_receiver_clock(body),
        other => Ok(RtcpPacket::Unknown {
            packet_type: other,
            fmt_or_count: count_or_fmt,
            payload: body,
        }),
    }
}

fn decode_receiver_report(mut body: Bytes) -> Result<RtcpPacket, Error> {
    if body.len() < 4 {
        return Err(Error::InvalidInput);
    }

    let sender_ssrc = body.get_u32();
    let mut reports = SmallVec::new();

    while body.len() >= 24 {
        let ssrc = body.get_u32();
        let fraction_lost = body[0];
        let cumulative_lost = i32::from_be_bytes([0, body[1], body[2], body[3]]);
        let cumulative_lost = if cumulative_lost & 0x0080_0000 != 0 {
            cumulative_lost | !0x00FF_FFFFi32
        } else {
            cumulative_lost
        };
        body.advance(4);
        let highest_sequence = body.get_u32();
        let jitter = body.get_u32();
        let last_sr = body.get_u32();
        let delay_since_last_sr = body.get_u32();

        reports.push(ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost,
            highest_sequence,
            jitter,
            last_sr,
            delay_since_last_sr,
        });
    }

    Ok(RtcpPacket::ReceiverReport {
        sender_ssrc,
        reports,
    })
}

fn decode_sdes(mut body: Bytes, chunk_count: u8) -> Result<RtcpPacket, Error> {
    let mut chunks = SmallVec::new();

    for _ in 0..chunk_count {
        if body.len() < 4 {
            break;
        }

        let ssrc = body.get_u32();
        let mut cname = None;

        loop {
            if body.is_empty() {
                break;
            }

            let item_type = body.get_u8();
            if item_type == 0 {
                // chunk terminator; consume padding to the next 32-bit boundary
                while !body.is_empty() && body[0] == 0 {
                    body.advance(1);
                }
                break;
            }

            if body.is_empty() {
                break;
            }

            let len = body.get_u8() as usize;
            if body.len() < len {
                return Err(Error::InvalidInput);
            }

            let text = body.split_to(len);
            if item_type == SDES_CNAME {
                cname = Some(std::str::from_utf8(&text)?.to_string());
            }
        }

        if let Some(cname) = cname {
            chunks.push((ssrc, cname));
        }
    }

    Ok(RtcpPacket::SourceDescription { chunks })
}

fn decode_goodbye(mut body: Bytes, source_count: u8) -> Result<RtcpPacket, Error> {
    let mut sources = SmallVec::new();
    for _ in 0..source_count {
        if body.len() < 4 {
            break;
        }
        sources.push(body.get_u32());
    }

    Ok(RtcpPacket::Goodbye { sources })
}

fn decode_nack(mut body: Bytes) -> Result<RtcpPacket, Error> {
    if body.len() < 8 {
        return Err(Error::InvalidInput);
    }

    let sender_ssrc = body.get_u32();
    let media_ssrc = body.get_u32();

    let mut pairs = Vec::with_capacity(body.len() / 4);
    while body.len() >= 4 {
        let pid = body.get_u16();
        let blp = body.get_u16();
        pairs.push((pid, blp));
    }

    Ok(RtcpPacket::TransportLayerNack {
        sender_ssrc,
        media_ssrc,
        pairs,
    })
}

/// Expands the (pid, blp) pairs of a `TransportLayerNack` into the full set
/// of missing sequence numbers (`spec.md` §3: "17-bit NACK pairs expanded
/// into sequence ranges").
pub fn expand_nack_pairs(pairs: &[(u16, u16)]) -> Vec<u16> {
    let mut missing = Vec::with_capacity(pairs.len() * 8);
    for &(pid, blp) in pairs {
        missing.push(pid);
        for bit in 0..16 {
            if blp & (1 << bit) != 0 {
                missing.push(pid.wrapping_add(bit + 1));
            }
        }
    }
    missing
}

/// Packs a sorted, de-duplicated set of missing sequence numbers into NACK
/// (pid, blp) pairs, greedily grouping each `pid` with up to 16 following
/// sequences that fit in its bitmask.
pub fn pack_nack_pairs(missing: &[u16]) -> Vec<(u16, u16)> {
    let mut pairs = Vec::new();
    let mut i = 0;

    while i < missing.len() {
        let pid = missing[i];
        let mut blp = 0u16;
        let mut j = i + 1;

        while j < missing.len() {
            let delta = missing[j].wrapping_sub(pid);
            if delta == 0 || delta > 16 {
                break;
            }
            blp |= 1 << (delta - 1);
            j += 1;
        }

        pairs.push((pid, blp));
        i = j;
    }

    pairs
}

fn decode_ccfb(mut body: Bytes) -> Result<RtcpPacket, Error> {
    if body.len() < 8 {
        return Err(Error::InvalidInput);
    }

    let sender_ssrc = body.get_u32();

    let mut reports = Vec::new();
    // The final 4 bytes of the RFC 8888 body are the report timestamp;
    // everything between the sender SSRC and that trailer is per-SSRC blocks.
    if body.len() < 4 {
        return Err(Error::InvalidInput);
    }
    let block_bytes_len = body.len() - 4;
    let mut blocks = body.split_to(block_bytes_len);
    let report_timestamp = body.get_u32();

    while blocks.len() >= 8 {
        let ssrc = blocks.get_u32();
        let base_sequence = blocks.get_u16();
        let status_count = blocks.get_u16() as usize;

        let mut status_bytes = status_count * 2;
        if status_count % 2 == 1 {
            // per-SSRC chunks are padded to a 32-bit boundary
            status_bytes += 2;
        }
        if blocks.len() < status_bytes {
            return Err(Error::InvalidInput);
        }

        let mut entries = Vec::with_capacity(status_count);
        for idx in 0..status_count {
            let word = blocks.get_u16();
            let received = word & 0x8000 != 0;
            let ecn_marked = word & 0x4000 != 0;
            let ato_ticks = word & 0x1FFF;
            let arrival_offset = Duration::from_secs_f64(ato_ticks as f64 / ATO_TICKS_PER_SECOND);

            entries.push(CcfbEntry {
                sequence: base_sequence.wrapping_add(idx as u16),
                received,
                ecn_marked,
                arrival_offset,
            });
        }
        if status_count % 2 == 1 {
            blocks.advance(2);
        }

        reports.push(CcfbSsrcReport {
            ssrc,
            base_sequence,
            entries,
        });
    }

    Ok(RtcpPacket::Ccfb {
        sender_ssrc,
        report_timestamp,
        reports,
    })
}

fn decode_sender_clock(mut body: Bytes) -> Result<RtcpPacket, Error> {
    if body.len() < 12 {
        return Err(Error::InvalidInput);
    }

    let sender_ssrc = body.get_u32();
    let ntp_time = body.get_u64();

    Ok(RtcpPacket::SenderClock {
        sender_ssrc,
        ntp_time,
    })
}

fn decode_receiver_clock(mut body: Bytes) -> Result<RtcpPacket, Error> {
    if body.len() < 16 {
        return Err(Error::InvalidInput);
    }

    let sender_ssrc = body.get_u32();
    let last_sender_ntp = body.get_u64();
    let delay_since_receive = body.get_u32();

    Ok(RtcpPacket::ReceiverClock {
        sender_ssrc,
        last_sender_ntp,
        delay_since_receive,
    })
}

fn put_header(out: &mut BytesMut, count_or_fmt: u8, packet_type: u8, length_words: u16) {
    out.put_u8((2 << 6) | (count_or_fmt & 0x1F));
    out.put_u8(packet_type);
    out.put_u16(length_words);
}

/// Encodes a single goodbye packet (used by tests and by path shutdown).
pub fn encode_goodbye(out: &mut BytesMut, sources: &[u32]) {
    let start = out.len();
    put_header(out, sources.len() as u8, PT_GOODBYE, sources.len() as u16);
    for ssrc in sources {
        out.put_u32(*ssrc);
    }
    fixup_length(out, start);
}

/// Encodes a transport-layer NACK packet (`spec.md` §6: PT 205, FMT 1).
pub fn encode_nack(out: &mut BytesMut, sender_ssrc: u32, media_ssrc: u32, pairs: &[(u16, u16)]) {
    let start = out.len();
    put_header(out, FMT_NACK, PT_TRANSPORT_FEEDBACK, 2 + pairs.len() as u16);
    out.put_u32(sender_ssrc);
    out.put_u32(media_ssrc);
    for (pid, blp) in pairs {
        out.put_u16(*pid);
        out.put_u16(*blp);
    }
    fixup_length(out, start);
}

/// Encodes a sender-clock packet (`spec.md` §6: PT 206, FMT/count 29).
pub fn encode_sender_clock(out: &mut BytesMut, sender_ssrc: u32, ntp_time: u64) {
    let start = out.len();
    put_header(out, FMT_SENDER_CLOCK, PT_PAYLOAD_SPECIFIC, 3);
    out.put_u32(sender_ssrc);
    out.put_u64(ntp_time);
    fixup_length(out, start);
}

/// Encodes a receiver-clock packet (`spec.md` §6: PT 206, FMT/count 30).
pub fn encode_receiver_clock(
    out: &mut BytesMut,
    sender_ssrc: u32,
    last_sender_ntp: u64,
    delay_since_receive: u32,
) {
    let start = out.len();
    put_header(out, FMT_RECEIVER_CLOCK, PT_PAYLOAD_SPECIFIC, 4);
    out.put_u32(sender_ssrc);
    out.put_u64(last_sender_ntp);
    out.put_u32(delay_since_receive);
    fixup_length(out, start);
}

/// Encodes a CCFB packet body. `reports` is `(ssrc, base_sequence,
/// [(received, ecn_marked, arrival_offset); N])`; `report_timestamp` is the
/// NTP-format 32-bit trailer (`spec.md` §6: "8-byte prefix (header + sender
/// SSRC) precedes the RFC 8888 body").
pub fn encode_ccfb(
    out: &mut BytesMut,
    sender_ssrc: u32,
    report_timestamp: u32,
    reports: &[(u32, u16, Vec<(bool, bool, Duration)>)],
) {
    let start = out.len();

    let mut body_bytes = 4usize; // sender ssrc
    for (_, _, entries) in reports {
        let mut block = 8 + entries.len() * 2;
        if entries.len() % 2 == 1 {
            block += 2; // pad the per-SSRC chunk to a 32-bit boundary
        }
        body_bytes += block;
    }
    body_bytes += 4; // report timestamp trailer

    debug_assert_eq!(body_bytes % 4, 0);
    let body_words = (body_bytes / 4) as u16;

    put_header(out, FMT_CCFB, PT_TRANSPORT_FEEDBACK, body_words);
    out.put_u32(sender_ssrc);

    for (ssrc, base_sequence, entries) in reports {
        out.put_u32(*ssrc);
        out.put_u16(*base_sequence);
        out.put_u16(entries.len() as u16);

        for (received, ecn_marked, arrival_offset) in entries {
            let ato_ticks =
                ((arrival_offset.as_secs_f64() * ATO_TICKS_PER_SECOND) as u32).min(ATO_MAX_TICKS);

            let mut word = ato_ticks as u16;
            if *received {
                word |= 0x8000;
            }
            if *ecn_marked {
                word |= 0x4000;
            }
            out.put_u16(word);
        }

        if entries.len() % 2 == 1 {
            out.put_u16(0);
        }
    }

    out.put_u32(report_timestamp);
    fixup_length(out, start);
}

/// Encodes a receiver report packet.
pub fn encode_receiver_report(out: &mut BytesMut, sender_ssrc: u32, reports: &[ReportBlock]) {
    let start = out.len();
    put_header(out, reports.len() as u8, PT_RECEIVER_REPORT, 1 + reports.len() as u16 * 6);
    out.put_u32(sender_ssrc);

    for r in reports {
        out.put_u32(r.ssrc);
        let cumulative = (r.cumulative_lost as u32) & 0x00FF_FFFF;
        out.put_u8(r.fraction_lost);
        out.put_u8((cumulative >> 16) as u8);
        out.put_u8((cumulative >> 8) as u8);
        out.put_u8(cumulative as u8);
        out.put_u32(r.highest_sequence);
        out.put_u32(r.jitter);
        out.put_u32(r.last_sr);
        out.put_u32(r.delay_since_last_sr);
    }

    fixup_length(out, start);
}

/// Encodes a source description packet carrying one CNAME item per chunk.
pub fn encode_sdes(out: &mut BytesMut, chunks: &[(u32, String)]) {
    let start = out.len();
    put_header(out, chunks.len() as u8, PT_SOURCE_DESCRIPTION, 0);

    for (ssrc, cname) in chunks {
        let chunk_start = out.len();
        out.put_u32(*ssrc);
        out.put_u8(SDES_CNAME);
        out.put_u8(cname.len().min(u8::MAX as usize) as u8);
        out.extend_from_slice(cname.as_bytes());
        out.put_u8(0);
        while (out.len() - chunk_start) % 4 != 0 {
            out.put_u8(0);
        }
    }

    fixup_length(out, start);
}

/// Re-encodes an opaque packet this crate doesn't interpret, verbatim.
pub fn encode_unknown(out: &mut BytesMut, packet_type: u8, fmt_or_count: u8, payload: &Bytes) {
    let start = out.len();
    let words = payload.len().div_ceil(4);
    put_header(out, fmt_or_count, packet_type, words as u16);
    out.extend_from_slice(payload);
    while (out.len() - start) % 4 != 0 {
        out.put_u8(0);
    }
    fixup_length(out, start);
}

impl RtcpPacket {
    /// Encodes this packet onto `out`, dispatching to the matching
    /// `encode_*` function. Used to build compounds mixing arbitrary packet
    /// kinds, e.g. a CCFB report alongside a passthrough `Unknown`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            RtcpPacket::ReceiverReport { sender_ssrc, reports } => {
                encode_receiver_report(out, *sender_ssrc, reports)
            }
            RtcpPacket::SourceDescription { chunks } => {
                encode_sdes(out, &chunks.iter().cloned().collect::<Vec<_>>())
            }
            RtcpPacket::Goodbye { sources } => {
                encode_goodbye(out, &sources.iter().copied().collect::<Vec<_>>())
            }
            RtcpPacket::TransportLayerNack {
                sender_ssrc,
                media_ssrc,
                pairs,
            } => encode_nack(out, *sender_ssrc, *media_ssrc, pairs),
            RtcpPacket::Ccfb {
                sender_ssrc,
                report_timestamp,
                reports,
            } => {
                let reports: Vec<(u32, u16, Vec<(bool, bool, Duration)>)> = reports
                    .iter()
                    .map(|r| {
                        (
                            r.ssrc,
                            r.base_sequence,
                            r.entries
                                .iter()
                                .map(|e| (e.received, e.ecn_marked, e.arrival_offset))
                                .collect(),
                        )
                    })
                    .collect();
                encode_ccfb(out, *sender_ssrc, *report_timestamp, &reports)
            }
            RtcpPacket::SenderClock {
                sender_ssrc,
                ntp_time,
            } => encode_sender_clock(out, *sender_ssrc, *ntp_time),
            RtcpPacket::ReceiverClock {
                sender_ssrc,
                last_sender_ntp,
                delay_since_receive,
            } => encode_receiver_clock(out, *sender_ssrc, *last_sender_ntp, *delay_since_receive),
            RtcpPacket::Unknown {
                packet_type,
                fmt_or_count,
                payload,
            } => encode_unknown(out, *packet_type, *fmt_or_count, payload),
        }
    }
}

/// Encodes a whole compound datagram from a mix of packet kinds.
pub fn encode_compound(packets: &[RtcpPacket]) -> Bytes {
    let mut out = BytesMut::new();
    for packet in packets {
        packet.encode(&mut out);
    }
    out.freeze()
}

fn fixup_length(out: &mut BytesMut, start: usize) {
    let total_len = out.len() - start;
    debug_assert_eq!(total_len % 4, 0);
    let words = (total_len / 4 - 1) as u16;
    out[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_pairs_round_trip() {
        let missing = vec![101u16, 102, 103, 104, 120];
        let pairs = pack_nack_pairs(&missing);
        let expanded = expand_nack_pairs(&pairs);
        assert_eq!(expanded, missing);
    }

    #[test]
    fn nack_packet_round_trips() {
        let mut buf = BytesMut::new();
        encode_nack(&mut buf, 1, 2, &[(101, 0b0111)]);

        let compound = decode_compound(buf.freeze()).unwrap();
        match &compound[0] {
            RtcpPacket::TransportLayerNack {
                sender_ssrc,
                media_ssrc,
                pairs,
            } => {
                assert_eq!(*sender_ssrc, 1);
                assert_eq!(*media_ssrc, 2);
                assert_eq!(pairs, &vec![(101, 0b0111)]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn clock_packets_round_trip() {
        let mut buf = BytesMut::new();
        encode_sender_clock(&mut buf, 7, 0x1122_3344_5566_7788);
        encode_receiver_clock(&mut buf, 7, 0x1122_3344_5566_7788, 0x0001_8000);

        let compound = decode_compound(buf.freeze()).unwrap();
        assert_eq!(compound.len(), 2);
        assert!(matches!(compound[0], RtcpPacket::SenderClock { .. }));
        assert!(matches!(compound[1], RtcpPacket::ReceiverClock { .. }));
    }

    #[test]
    fn ccfb_packet_round_trips() {
        let mut buf = BytesMut::new();
        encode_ccfb(
            &mut buf,
            5,
            999,
            &[(
                42,
                100,
                vec![
                    (true, false, Duration::from_millis(12)),
                    (true, true, Duration::from_millis(3)),
                    (false, false, Duration::ZERO),
                ],
            )],
        );

        let compound = decode_compound(buf.freeze()).unwrap();
        match &compound[0] {
            RtcpPacket::Ccfb {
                sender_ssrc,
                report_timestamp,
                reports,
            } => {
                assert_eq!(*sender_ssrc, 5);
                assert_eq!(*report_timestamp, 999);
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].ssrc, 42);
                assert_eq!(reports[0].entries.len(), 3);
                assert!(reports[0].entries[0].received);
                assert!((reports[0].entries[0].arrival_offset.as_secs_f64() - 0.012).abs() < 0.001);
                assert!(reports[0].entries[1].ecn_marked);
                assert!(!reports[0].entries[2].received);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn ccfb_packet_round_trips_with_odd_entry_count() {
        let mut buf = BytesMut::new();
        encode_ccfb(
            &mut buf,
            5,
            0,
            &[(
                42,
                100,
                vec![(true, false, Duration::ZERO), (true, false, Duration::ZERO)],
            )],
        );
        // sanity: even count has no padding, odd count below does
        let mut buf2 = BytesMut::new();
        encode_ccfb(&mut buf2, 5, 0, &[(42, 100, vec![(true, false, Duration::ZERO)])]);

        assert_eq!(buf.len(), buf2.len());
        let compound = decode_compound(buf2.freeze()).unwrap();
        match &compound[0] {
            RtcpPacket::Ccfb { reports, .. } => assert_eq!(reports[0].entries.len(), 1),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn generic_encode_round_trips_a_mixed_compound() {
        let packets = vec![
            RtcpPacket::SourceDescription {
                chunks: smallvec![(7, "alice@example.com".to_string())],
            },
            RtcpPacket::ReceiverReport {
                sender_ssrc: 1,
                reports: smallvec![ReportBlock {
                    ssrc: 7,
                    fraction_lost: 0,
                    cumulative_lost: 3,
                    highest_sequence: 1000,
                    jitter: 5,
                    last_sr: 0,
                    delay_since_last_sr: 0,
                }],
            },
            RtcpPacket::Unknown {
                packet_type: 211,
                fmt_or_count: 4,
                payload: Bytes::from_static(&[1, 2, 3, 4]),
            },
        ];

        let compound = decode_compound(encode_compound(&packets)).unwrap();
        assert_eq!(compound.len(), 3);
        match &compound[0] {
            RtcpPacket::SourceDescription { chunks } => {
                assert_eq!(chunks[0].1, "alice@example.com");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        match &compound[1] {
            RtcpPacket::ReceiverReport { reports, .. } => {
                assert_eq!(reports[0].cumulative_lost, 3);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        match &compound[2] {
            RtcpPacket::Unknown {
                packet_type,
                payload,
                ..
            } => {
                assert_eq!(*packet_type, 211);
                assert_eq!(payload.as_ref(), &[1, 2, 3, 4]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn goodbye_destination_ssrcs() {
        let mut buf = BytesMut::new();
        encode_goodbye(&mut buf, &[10, 20]);

        let compound = decode_compound(buf.freeze()).unwrap();
        assert_eq!(
            compound[0].destination_ssrcs().into_vec(),
            vec![10, 20]
        );
    }
}

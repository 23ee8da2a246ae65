//! The [RTP] fixed header plus the one-byte-header extension profile
//! ([RFC5285]) used to carry the transport-wide sequence number.
//!
//! [RTP]: https://tools.ietf.org/html/rfc3550#section-5.1
//! [RFC5285]: https://tools.ietf.org/html/rfc5285

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::{Error, TRANSPORT_WIDE_SEQUENCE_EXTENSION_ID};

const FIXED_HEADER_LEN: usize = 12;
const ONE_BYTE_EXTENSION_PROFILE: u16 = 0xBEDE;

/// A single one-byte-header extension element: a 4-bit id and 1-16 bytes of
/// data (`spec.md` §3: "optional one-byte-header extension with a known
/// identifier carrying a transport-wide 16-bit sequence").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub id: u8,
    pub data: Bytes,
}

/// Header fields used by the core (`spec.md` §3).
///
/// `csrc` and `extensions` are usually empty; they are kept as `SmallVec`s
/// so the common case never touches the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: SmallVec<[u32; 4]>,
    pub extensions: SmallVec<[Extension; 2]>,
}

impl RtpHeader {
    /// Looks up the transport-wide sequence number carried in extension id
    /// [`TRANSPORT_WIDE_SEQUENCE_EXTENSION_ID`], if present.
    pub fn transport_wide_sequence(&self) -> Option<u16> {
        self.extensions
            .iter()
            .find(|ext| ext.id == TRANSPORT_WIDE_SEQUENCE_EXTENSION_ID && ext.data.len() == 2)
            .map(|ext| u16::from_be_bytes([ext.data[0], ext.data[1]]))
    }

    /// Returns a copy of this header with the transport-wide sequence
    /// extension set (replacing any previous value).
    pub fn with_transport_wide_sequence(mut self, seq: u16) -> Self {
        self.extensions
            .retain(|ext| ext.id != TRANSPORT_WIDE_SEQUENCE_EXTENSION_ID);
        self.extensions.push(Extension {
            id: TRANSPORT_WIDE_SEQUENCE_EXTENSION_ID,
            data: Bytes::copy_from_slice(&seq.to_be_bytes()),
        });
        self
    }
}

/// An immutable RTP packet: a header plus an opaque payload
/// (`spec.md` §3: "Packets are immutable after creation by the sender").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Decodes a fixed RTP header plus, when the extension bit is set, a
    /// one-byte-header extension block.
    ///
    /// # Examples
    ///
    /// ```
    /// use rtp_proto::rtp::RtpPacket;
    ///
    /// let mut bytes = bytes::BytesMut::new();
    /// let packet = RtpPacket {
    ///     header: rtp_proto::rtp::RtpHeader {
    ///         version: 2,
    ///         padding: false,
    ///         marker: true,
    ///         payload_type: 96,
    ///         sequence_number: 100,
    ///         timestamp: 9000,
    ///         ssrc: 0xdeadbeef,
    ///         csrc: Default::default(),
    ///         extensions: Default::default(),
    ///     },
    ///     payload: bytes::Bytes::from_static(b"hello"),
    /// };
    ///
    /// packet.clone().encode(&mut bytes);
    /// let decoded = RtpPacket::decode(bytes.freeze()).unwrap();
    /// assert_eq!(decoded, packet);
    /// ```
    pub fn decode(mut bytes: Bytes) -> Result<Self, Error> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(Error::InvalidInput);
        }

        let b0 = bytes[0];
        let version = b0 >> 6;
        let padding = (b0 & 0x20) != 0;
        let has_extension = (b0 & 0x10) != 0;
        let csrc_count = (b0 & 0x0F) as usize;

        let b1 = bytes[1];
        let marker = (b1 & 0x80) != 0;
        let payload_type = b1 & 0x7F;

        let sequence_number = u16::from_be_bytes(bytes[2..4].try_into()?);
        let timestamp = u32::from_be_bytes(bytes[4..8].try_into()?);
        let ssrc = u32::from_be_bytes(bytes[8..12].try_into()?);

        bytes.advance(FIXED_HEADER_LEN);

        if bytes.len() < csrc_count * 4 {
            return Err(Error::InvalidInput);
        }

        let mut csrc = SmallVec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(bytes.get_u32());
        }

        let mut extensions = SmallVec::new();
        if has_extension {
            if bytes.len() < 4 {
                return Err(Error::InvalidInput);
            }

            let profile = bytes.get_u16();
            let ext_words = bytes.get_u16() as usize;
            let ext_len = ext_words * 4;

            if bytes.len() < ext_len {
                return Err(Error::InvalidInput);
            }

            let mut ext_bytes = bytes.split_to(ext_len);
            if profile == ONE_BYTE_EXTENSION_PROFILE {
                while ext_bytes.has_remaining() {
                    let b = ext_bytes[0];
                    if b == 0x00 {
                        // padding byte between elements
                        ext_bytes.advance(1);
                        continue;
                    }

                    let id = b >> 4;
                    let len = (b & 0x0F) as usize + 1;
                    ext_bytes.advance(1);

                    if ext_bytes.len() < len {
                        break;
                    }

                    let data = ext_bytes.split_to(len).freeze();
                    extensions.push(Extension { id, data });
                }
            }
        }

        Ok(RtpPacket {
            header: RtpHeader {
                version,
                padding,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrc,
                extensions,
            },
            payload: bytes,
        })
    }

    /// Encodes this packet onto `out`, appending rather than clearing it.
    pub fn encode(self, out: &mut BytesMut) {
        let header = &self.header;

        let has_extension = !header.extensions.is_empty();
        let b0 = (header.version << 6)
            | ((header.padding as u8) << 5)
            | ((has_extension as u8) << 4)
            | (header.csrc.len() as u8 & 0x0F);
        out.put_u8(b0);
        out.put_u8(((header.marker as u8) << 7) | (header.payload_type & 0x7F));
        out.put_u16(header.sequence_number);
        out.put_u32(header.timestamp);
        out.put_u32(header.ssrc);

        for csrc in &header.csrc {
            out.put_u32(*csrc);
        }

        if has_extension {
            let mut ext_bytes = BytesMut::new();
            for ext in &header.extensions {
                let len = ext.data.len().clamp(1, 16);
                ext_bytes.put_u8((ext.id << 4) | (len as u8 - 1));
                ext_bytes.extend_from_slice(&ext.data);
            }

            while ext_bytes.len() % 4 != 0 {
                ext_bytes.put_u8(0);
            }

            out.put_u16(ONE_BYTE_EXTENSION_PROFILE);
            out.put_u16((ext_bytes.len() / 4) as u16);
            out.extend_from_slice(&ext_bytes);
        }

        out.extend_from_slice(&self.payload);
    }
}

/// `true` if the RTP/RTCP-multiplexed payload-type byte indicates RTP
/// rather than RTCP (`spec.md` §6, RFC 5761 payload-type range check).
///
/// RTCP occupies the dynamic ranges 64-95 (the second byte's low 7 bits
/// carries the packet type for RTCP, e.g. 200-207) and 200-207; everything
/// else is RTP.
pub fn is_rtp_payload_type(second_byte: u8) -> bool {
    let pt = second_byte & 0x7F;
    !((64..=95).contains(&pt) || (200..=207).contains(&pt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker: false,
                payload_type: 111,
                sequence_number: 42,
                timestamp: 12345,
                ssrc: 0xA5A5A5A5,
                csrc: SmallVec::new(),
                extensions: SmallVec::new(),
            },
            payload: Bytes::from_static(b"payload-bytes"),
        }
    }

    #[test]
    fn round_trips_without_extension() {
        let packet = sample();
        let mut out = BytesMut::new();
        packet.clone().encode(&mut out);

        let decoded = RtpPacket::decode(out.freeze()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trips_transport_wide_extension() {
        let mut packet = sample();
        packet.header = packet.header.with_transport_wide_sequence(0xBEEF);

        let mut out = BytesMut::new();
        packet.clone().encode(&mut out);

        let decoded = RtpPacket::decode(out.freeze()).unwrap();
        assert_eq!(decoded.header.transport_wide_sequence(), Some(0xBEEF));
        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(matches!(
            RtpPacket::decode(Bytes::from_static(b"x")),
            Err(Error::InvalidInput)
        ));
    }

    #[test]
    fn payload_type_range_classifies_rtcp() {
        assert!(!is_rtp_payload_type(205));
        assert!(!is_rtp_payload_type(72));
        assert!(is_rtp_payload_type(111));
    }
}

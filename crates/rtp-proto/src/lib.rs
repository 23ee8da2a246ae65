//! ## Real-time Transport Protocol (RTP) and RTP Control Protocol (RTCP)
//!
//! [RFC3550]: https://tools.ietf.org/html/rfc3550
//! [RFC5285]: https://tools.ietf.org/html/rfc5285
//! [RFC4585]: https://tools.ietf.org/html/rfc4585
//! [RFC8888]: https://tools.ietf.org/html/rfc8888
//!
//! RTP carries media between a sender and a relay; RTCP carries the
//! feedback (receiver reports, NACKs, congestion-control feedback, and two
//! proprietary clock-synchronization formats) that flows the other way.
//! This crate only implements the wire formats the packet-transport and
//! recovery engine touches: it does not attempt full RFC coverage of every
//! RTCP packet type.

pub mod ntp;
pub mod rtcp;
pub mod rtp;

use std::{array::TryFromSliceError, str::Utf8Error};

/// Header extension id reserved for the transport-wide sequence number.
///
/// See `spec.md` §6: "Header extension id 5 is reserved for transport-wide
/// sequence."
pub const TRANSPORT_WIDE_SEQUENCE_EXTENSION_ID: u8 = 5;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnknownPacketType,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

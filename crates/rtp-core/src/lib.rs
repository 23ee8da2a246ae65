//! Packet-transport and recovery engine: the staged jitter buffer with NACK
//! emission, the sender-side retransmission buffer, multi-path link bonding
//! with per-path NADA-style congestion control, and the SSRC/CNAME/
//! payload-type demultiplexing tree used on the relay's ingress side.

pub mod bonded;
pub mod clock;
pub mod collab;
pub mod demux;
pub mod ingress;
pub mod jitter;
pub mod nada;
pub mod path;
pub mod send_buffer;

#[derive(Debug)]
pub enum Error {
    Decode(rtp_proto::Error),
    RouteUnknown(u32),
    NoPathAvailable,
    PathError(std::io::Error),
    FeedbackOrphan(u16),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Decode(e) => write!(f, "decode error: {e}"),
            Error::RouteUnknown(ssrc) => write!(f, "no known address for ssrc {ssrc}"),
            Error::NoPathAvailable => write!(f, "no path with a positive target rate"),
            Error::PathError(e) => write!(f, "path error: {e}"),
            Error::FeedbackOrphan(seq) => write!(f, "feedback for unknown cc-seq {seq}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<rtp_proto::Error> for Error {
    fn from(value: rtp_proto::Error) -> Self {
        Self::Decode(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::PathError(value)
    }
}

/// Modular distance from `from` to `to` on a 16-bit sequence space, in
/// `(-2^15, 2^15]`. Positive means `to` is ahead of `from`.
pub fn seq_delta(from: u16, to: u16) -> i32 {
    (to.wrapping_sub(from) as i16) as i32
}

//! MPEG transport streams.

pub mod demuxer;
pub mod packet;
pub mod pes;
pub mod psi;
pub mod stream;

pub use demuxer::{stream_duration, M2tsDemuxer};
pub use packet::{TsPacket, PACKET_LEN};

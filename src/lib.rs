//! A user-space implementation of the Homa transport protocol: a low-latency,
//!  receiver-driven datagram transport for datacenter fabrics. The abstraction is sending /
//!  receiving *messages* (defined-length chunks of data as opposed to streams of bytes);
//!  the transport takes care of fragmentation, scheduling, retransmission and re-assembly
//!  on top of an unreliable packet driver.
//!
//! ## Design goals
//!
//! * Minimise latency for short messages on fast, largely reliable networks (i.e. inside a
//!   data center)
//!   * a message no longer than one bandwidth-delay product is transmitted immediately and
//!     completely, without waiting for any permission from the receiver
//!   * short messages travel at higher fabric priority than the bulk of long ones
//! * Receiver-driven congestion control
//!   * beyond the unscheduled prefix, a sender transmits only bytes the receiver explicitly
//!     *granted*
//!   * the receiver grants the messages with the least remaining bytes first (SRPT),
//!     overcommitting to a handful of senders so stragglers cannot idle the link
//! * No connection setup: every packet carries a globally unique message id, and per-message
//!   state on both sides is created and discarded on the fly
//! * At-least-once delivery rather than exactly-once: lost packets are re-requested and
//!   retransmitted until the receiver acknowledges completion, times out, or the sender
//!   cancels; deduplication beyond the per-message byte ranges is left to higher layers
//! * No ordering guarantees across messages - SRPT scheduling deliberately reorders
//!   delivery; within a single message, bytes are contiguous and in order
//! * All progress is driven by repeated calls to [`Transport::poll`]: no internal threads,
//!   no blocking, no suspension points. Many application threads may use the transport
//!   concurrently, one thread (any thread) drives progress.
//!
//! ## Wire format
//!
//! Every packet starts with a two-byte prefix - all numbers in network byte order (BE):
//! ```ascii
//! 0: protocol version (u8)
//! 1: opcode (u8):
//!    * 0 DATA     - a payload fragment, sender -> receiver
//!    * 1 GRANT    - authorization to transmit further bytes, receiver -> sender
//!    * 2 DONE     - completion acknowledgement, receiver -> sender
//!    * 3 RESEND   - retransmission request for a byte range, receiver -> sender
//!    * 4 BUSY     - "alive, be patient", both directions
//!    * 5 PING     - liveness probe, both directions
//!    * 6 UNKNOWN  - "no state for this id", receiver -> sender
//!    * 7 ERROR    - unrecoverable per-message failure, receiver -> sender
//! ```
//!
//! The opcode-specific header records follow the prefix; see `packet_header` and
//!  `control_messages`. DATA payload fragments sit on fixed per-packet boundaries so
//!  both sides derive fragment indices from the byte offset alone.
//!
//! ## Related
//!
//! * TCP: stream-oriented, in-order, connection setup; head-of-line blocking makes short
//!   RPCs pay for long transfers sharing the connection
//! * QUIC: stream multiplexing and loss recovery, but still window/ack based and
//!   connection-oriented with an initial handshake
//! * Homa (the protocol this implements): receiver-driven grants, SRPT scheduling and
//!   priority bands; designed around message latency instead of stream throughput

mod config;
mod control_messages;
mod driver;
mod message_id;
mod packet_header;
mod policy;
mod receiver;
mod safe_converter;
mod sender;
mod timer;
mod transport;

pub use config::HomaConfig;
pub use driver::{Driver, PacketBufPool, UdpDriver};
pub use message_id::MessageId;
pub use sender::{OutboundStatus, SendFlags};
pub use transport::{InMessage, OutMessage, Transport};

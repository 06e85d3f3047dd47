use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;

use anyhow::Context;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tracing::{debug, error, trace};

/// Abstraction over the packet fabric the transport runs on, introduced both to keep
///  NIC-specific code out of the protocol engine and to facilitate mocking the I/O away
///  for testing.
///
/// The driver owns packet buffer allocation; the transport borrows buffers via
///  `alloc_packet` and hands them back via `release_packet` once a message is retired.
#[cfg_attr(test, automock)]
pub trait Driver: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// Parses a peer address in the driver's address format.
    fn parse_addr(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let parsed: SocketAddr = addr.parse().context("unparsable address")?;
        Ok(parsed)
    }

    /// The maximum number of bytes a single packet can carry, headers included. All
    ///  transports on a fabric must agree on this value since packet fragment boundaries
    ///  are derived from it on both sides.
    fn max_payload_size(&self) -> usize;

    /// Link bandwidth in bits per second, used to derive RTT-bytes.
    fn bandwidth_bps(&self) -> u64;

    fn alloc_packet(&self) -> BytesMut;

    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()>;

    /// Appends up to `max` received packets to `out`, returning how many were appended.
    ///  MUST NOT block.
    fn receive_packets(&self, max: usize, out: &mut Vec<(SocketAddr, BytesMut)>) -> usize;

    fn release_packet(&self, packet: BytesMut);
}

/// Pool of packet buffers so steady-state operation does not allocate. Buffers in excess
///  of the pool capacity are simply dropped on return.
pub struct PacketBufPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl PacketBufPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> PacketBufPool {
        PacketBufPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn put(&self, mut buffer: BytesMut) {
        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// Driver backed by a non-blocking `std::net::UdpSocket`, mostly useful for tests and
///  small deployments - a kernel-bypass driver would implement the same trait.
///
/// UDP does not expose link bandwidth, so it is configured here. The packet size must fit
///  the path MTU end to end; with full Ethernet frames and no optional IP headers that is
///  `1500 - 20 - 8 = 1472` for IPV4.
pub struct UdpDriver {
    socket: UdpSocket,
    local_addr: SocketAddr,
    max_payload_size: usize,
    bandwidth_bps: u64,
    pool: PacketBufPool,
}

impl UdpDriver {
    pub fn bind(
        addr: SocketAddr,
        max_payload_size: usize,
        bandwidth_bps: u64,
    ) -> anyhow::Result<UdpDriver> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        debug!("bound UDP driver to {:?}", local_addr);

        Ok(UdpDriver {
            socket,
            local_addr,
            max_payload_size,
            bandwidth_bps,
            pool: PacketBufPool::new(max_payload_size, 1024),
        })
    }
}

impl Driver for UdpDriver {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    fn bandwidth_bps(&self) -> u64 {
        self.bandwidth_bps
    }

    fn alloc_packet(&self) -> BytesMut {
        self.pool.get()
    }

    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP driver: sending packet of {} bytes to {:?}", packet_buf.len(), to);
        self.socket
            .send_to(packet_buf, to)
            .with_context(|| format!("error sending UDP packet to {:?}", to))?;
        Ok(())
    }

    fn receive_packets(&self, max: usize, out: &mut Vec<(SocketAddr, BytesMut)>) -> usize {
        let mut num_received = 0;
        while num_received < max {
            let mut buf = self.pool.get();
            buf.resize(self.max_payload_size, 0);

            match self.socket.recv_from(buf.as_mut()) {
                Ok((num_read, from)) => {
                    buf.truncate(num_read);
                    trace!("received packet of {} bytes from {:?}", num_read, from);
                    out.push((from, buf));
                    num_received += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.pool.put(buf);
                    break;
                }
                Err(e) => {
                    error!("socket error: {}", e);
                    self.pool.put(buf);
                    break;
                }
            }
        }
        num_received
    }

    fn release_packet(&self, packet: BytesMut) {
        self.pool.put(packet);
    }
}

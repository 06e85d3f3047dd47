use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use homa::{Driver, HomaConfig, Transport};

type Filter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// An in-memory packet fabric connecting any number of [`FakeDriver`]s. Packets are
/// delivered in order and without loss unless a filter decides otherwise, which makes the
/// end-to-end tests fully deterministic.
pub struct Fabric {
    queues: Mutex<HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>>,
    /// returns false to drop the packet
    filter: Mutex<Option<Filter>>,
    /// opcode byte of every packet that was actually delivered
    opcode_log: Mutex<Vec<u8>>,
    next_port: AtomicU16,
}

impl Fabric {
    pub fn new() -> Arc<Fabric> {
        Arc::new(Fabric {
            queues: Mutex::new(HashMap::new()),
            filter: Mutex::new(None),
            opcode_log: Mutex::new(Vec::new()),
            next_port: AtomicU16::new(1),
        })
    }

    pub fn set_filter(&self, filter: impl FnMut(&[u8]) -> bool + Send + 'static) {
        *self.filter.lock().unwrap() = Some(Box::new(filter));
    }

    pub fn delivered_opcodes(&self) -> Vec<u8> {
        self.opcode_log.lock().unwrap().clone()
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, packet: &[u8]) {
        if let Some(filter) = self.filter.lock().unwrap().as_mut() {
            if !filter(packet) {
                return;
            }
        }
        let mut queues = self.queues.lock().unwrap();
        if let Some(queue) = queues.get_mut(&to) {
            self.opcode_log.lock().unwrap().push(packet[1]);
            queue.push_back((from, packet.to_vec()));
        }
    }
}

pub struct FakeDriver {
    fabric: Arc<Fabric>,
    addr: SocketAddr,
    max_payload_size: usize,
    bandwidth_bps: u64,
}

impl FakeDriver {
    pub fn new(fabric: &Arc<Fabric>, max_payload_size: usize, bandwidth_bps: u64) -> FakeDriver {
        let port = fabric.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::from(([10, 99, 0, 1], port));
        fabric.queues.lock().unwrap().insert(addr, VecDeque::new());
        FakeDriver {
            fabric: fabric.clone(),
            addr,
            max_payload_size,
            bandwidth_bps,
        }
    }
}

impl Driver for FakeDriver {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    fn bandwidth_bps(&self) -> u64 {
        self.bandwidth_bps
    }

    fn alloc_packet(&self) -> BytesMut {
        BytesMut::with_capacity(self.max_payload_size)
    }

    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        self.fabric.deliver(self.addr, to, packet_buf);
        Ok(())
    }

    fn receive_packets(&self, max: usize, out: &mut Vec<(SocketAddr, BytesMut)>) -> usize {
        let mut queues = self.fabric.queues.lock().unwrap();
        let queue = queues.get_mut(&self.addr).expect("driver was registered on creation");
        let mut num_received = 0;
        while num_received < max {
            let Some((from, packet)) = queue.pop_front() else {
                break;
            };
            out.push((from, BytesMut::from(packet.as_slice())));
            num_received += 1;
        }
        num_received
    }

    fn release_packet(&self, _packet: BytesMut) {}
}

/// Wire-level constants the tests rely on: with a fabric packet size of 132 bytes and the
/// 32-byte DATA header, every DATA packet carries up to 100 payload bytes; at 8 Mbit/s and
/// 200us RTT the bandwidth-delay product is 200 bytes.
pub const MAX_PAYLOAD_SIZE: usize = 132;
pub const BANDWIDTH_BPS: u64 = 8_000_000;
pub const RTT_BYTES: usize = 200;

pub const OPCODE_DATA: u8 = 0;
pub const OPCODE_GRANT: u8 = 1;
pub const OPCODE_DONE: u8 = 2;

pub fn test_config() -> HomaConfig {
    let mut config = HomaConfig::default_datacenter();
    config.rtt_micros = 200;
    config.resend_interval_ticks = 10;
    config.ping_interval_ticks = 25;
    config.timeout_ticks = 300;
    config
}

/// Two transports on a shared fabric, pumped in lockstep.
pub struct Pair {
    pub fabric: Arc<Fabric>,
    pub a: Transport,
    pub b: Transport,
}

impl Pair {
    pub fn new() -> Pair {
        let fabric = Fabric::new();
        let a = Transport::new(
            Arc::new(FakeDriver::new(&fabric, MAX_PAYLOAD_SIZE, BANDWIDTH_BPS)),
            test_config(),
        )
        .unwrap();
        let b = Transport::new(
            Arc::new(FakeDriver::new(&fabric, MAX_PAYLOAD_SIZE, BANDWIDTH_BPS)),
            test_config(),
        )
        .unwrap();
        Pair { fabric, a, b }
    }

    pub fn pump(&self, polls: usize) {
        for _ in 0..polls {
            self.a.poll();
            self.b.poll();
        }
    }

    /// Pumps until the condition holds, asserting it does within the given number of polls.
    pub fn pump_until(&self, max_polls: usize, mut condition: impl FnMut() -> bool) {
        for _ in 0..max_polls {
            if condition() {
                return;
            }
            self.a.poll();
            self.b.poll();
        }
        assert!(condition(), "condition not reached within {} polls", max_polls);
    }
}

/// A payload where every byte depends on its position, so any reordering or corruption
/// shows up in an equality check.
pub fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

//! In-memory network device for tests and demos.
//!
//! [`SimulatedDevice`] implements [`crate::device::Device`] over one end of a
//! `UnixDatagram` pair, so the event loop can poll it like a real TUN
//! descriptor and every datagram is exactly one frame.  The other end is a
//! [`Wire`] that plays the remote network: it injects frames into the stack
//! and collects the frames the stack writes.
//!
//! ```text
//!   test / remote peer                       stack
//!   ┌──────┐  inject()  ──────────────▶  ┌─────────────────┐
//!   │ Wire │                             │ SimulatedDevice │ ─▶ EventLoop
//!   └──────┘  recv()    ◀──────────────  └─────────────────┘
//! ```
//!
//! Frames entering the stack can pass through a fault model:
//!
//! | Fault       | Effect                                           |
//! |-------------|--------------------------------------------------|
//! | Loss        | Drop the frame with probability `loss_rate`.     |
//! | Duplication | Deliver the frame twice.                         |
//! | Corruption  | Flip one random bit, which checksums must catch. |
//!
//! Faults draw from a seeded RNG so failures are reproducible.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DeviceMode;
use crate::device::Device;

/// Fault probabilities for inbound frames, each in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0x5eed,
        }
    }
}

/// The stack's side of a simulated link.
#[derive(Debug)]
pub struct SimulatedDevice {
    socket: UnixDatagram,
    name: String,
    faults: FaultConfig,
    rng: StdRng,
    /// Duplicates waiting to be read before the next socket datagram.
    replay: VecDeque<Vec<u8>>,
    pub stats: FaultStats,
}

/// What the fault model did so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
}

/// The remote side of a simulated link.
#[derive(Debug)]
pub struct Wire {
    socket: UnixDatagram,
}

impl SimulatedDevice {
    /// A fault-free link.
    pub fn pair(name: &str) -> io::Result<(Self, Wire)> {
        Self::with_faults(name, FaultConfig::default())
    }

    pub fn with_faults(name: &str, faults: FaultConfig) -> io::Result<(Self, Wire)> {
        let (stack_end, wire_end) = UnixDatagram::pair()?;
        stack_end.set_nonblocking(true)?;
        let rng = StdRng::seed_from_u64(faults.seed);
        let device = Self {
            socket: stack_end,
            name: name.to_string(),
            faults,
            rng,
            replay: VecDeque::new(),
            stats: FaultStats::default(),
        };
        Ok((device, Wire { socket: wire_end }))
    }

    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.random_bool(rate.min(1.0))
    }
}

impl Device for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> DeviceMode {
        DeviceMode::Tun
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(frame) = self.replay.pop_front() {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                return Ok(n);
            }

            let n = match self.socket.recv(buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(e),
            };
            if self.roll(self.faults.loss_rate) {
                self.stats.dropped += 1;
                log::debug!("[dev] {} dropped {n}-byte frame", self.name);
                continue;
            }
            if n > 0 && self.roll(self.faults.corrupt_rate) {
                let bit = self.rng.random_range(0..n * 8);
                buf[bit / 8] ^= 1 << (bit % 8);
                self.stats.corrupted += 1;
                log::debug!("[dev] {} flipped bit {bit}", self.name);
            }
            if self.roll(self.faults.duplicate_rate) {
                self.replay.push_back(buf[..n].to_vec());
                self.stats.duplicated += 1;
            }
            self.stats.delivered += 1;
            return Ok(n);
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.socket.send(frame)
    }
}

impl Wire {
    /// Put a frame on the link towards the stack.
    pub fn inject(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).map(|_| ())
    }

    /// Next frame written by the stack, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; 65_535];
        match self.socket.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Every frame the stack has written so far, without waiting.
    pub fn drain(&self) -> io::Result<Vec<Vec<u8>>> {
        self.socket.set_nonblocking(true)?;
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 65_535];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => frames.push(buf[..n].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.socket.set_nonblocking(false)?;
                    return Err(e);
                }
            }
        }
        self.socket.set_nonblocking(false)?;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_the_link_intact() {
        let (mut dev, wire) = SimulatedDevice::pair("sim0").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(dev.read_frame(&mut buf).unwrap(), 0);

        wire.inject(b"frame-one").unwrap();
        wire.inject(b"two").unwrap();
        assert_eq!(dev.read_frame(&mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"frame-one");
        assert_eq!(dev.read_frame(&mut buf).unwrap(), 3);

        dev.write_frame(b"reply").unwrap();
        assert_eq!(wire.drain().unwrap(), vec![b"reply".to_vec()]);
    }

    #[test]
    fn total_loss_drops_everything() {
        let faults = FaultConfig {
            loss_rate: 1.0,
            ..FaultConfig::default()
        };
        let (mut dev, wire) = SimulatedDevice::with_faults("sim0", faults).unwrap();
        wire.inject(b"x").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(dev.read_frame(&mut buf).unwrap(), 0);
        assert_eq!(dev.stats.dropped, 1);
    }

    #[test]
    fn duplication_replays_frame() {
        let faults = FaultConfig {
            duplicate_rate: 1.0,
            ..FaultConfig::default()
        };
        let (mut dev, wire) = SimulatedDevice::with_faults("sim0", faults).unwrap();
        wire.inject(b"dup").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(dev.read_frame(&mut buf).unwrap(), 3);
        assert_eq!(dev.read_frame(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"dup");
    }

    #[test]
    fn corruption_changes_one_bit() {
        let faults = FaultConfig {
            corrupt_rate: 1.0,
            ..FaultConfig::default()
        };
        let (mut dev, wire) = SimulatedDevice::with_faults("sim0", faults).unwrap();
        wire.inject(&[0u8; 4]).unwrap();
        let mut buf = [0u8; 4];
        dev.read_frame(&mut buf).unwrap();
        let flipped: u32 = buf.iter().map(|b| b.count_ones()).sum();
        assert_eq!(flipped, 1);
    }
}

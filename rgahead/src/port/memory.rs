//! In-process port pair.
//!
//! [`MemoryPort::pair`] returns two connected endpoints: bytes written to one
//! are read from the other. Reads honour the configured timeout and report
//! `TimedOut` like a real serial port. Each endpoint drives the peer's
//! clear-to-send line through [`MemoryPort::set_request_to_send`].

use {
    crate::{
        error::{Error, Result},
        port::Port,
    },
    parking_lot::{Condvar, Mutex},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::{Duration, Instant},
    },
};

#[derive(Default)]
struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    readable: Condvar,
    closed: AtomicBool,
}

impl Pipe {
    fn push(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        self.buf.lock().extend(data.iter().copied());
        self.readable.notify_all();
        Ok(())
    }

    fn pop(&self, out: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut buf = self.buf.lock();
        while buf.is_empty() {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            if self.readable.wait_until(&mut buf, deadline).timed_out() && buf.is_empty() {
                if self.closed.load(Ordering::Acquire) {
                    return Ok(0);
                }
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
        }
        let n = out.len().min(buf.len());
        for (slot, byte) in out.iter_mut().zip(buf.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.buf.lock();
        self.readable.notify_all();
    }
}

/// One endpoint of an in-memory duplex stream.
pub struct MemoryPort {
    name: String,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    cts: Arc<AtomicBool>,
    peer_cts: Arc<AtomicBool>,
    timeout: Duration,
}

impl MemoryPort {
    /// Create two connected endpoints. Both start with CTS asserted.
    pub fn pair(name: &str) -> (Self, Self) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let a_cts = Arc::new(AtomicBool::new(true));
        let b_cts = Arc::new(AtomicBool::new(true));
        let timeout = Duration::from_millis(20);

        let host = Self {
            name: name.to_string(),
            rx: Arc::clone(&b_to_a),
            tx: Arc::clone(&a_to_b),
            cts: Arc::clone(&a_cts),
            peer_cts: Arc::clone(&b_cts),
            timeout,
        };
        let device = Self {
            name: format!("{name}-peer"),
            rx: a_to_b,
            tx: b_to_a,
            cts: b_cts,
            peer_cts: a_cts,
            timeout,
        };
        (host, device)
    }

    /// Drive the peer's clear-to-send line.
    pub fn set_request_to_send(&self, level: bool) {
        self.peer_cts.store(level, Ordering::Release);
    }

    /// Whether the stream has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.rx.closed.load(Ordering::Acquire) || self.tx.closed.load(Ordering::Acquire)
    }

    fn handle(&self) -> Self {
        Self {
            name: self.name.clone(),
            rx: Arc::clone(&self.rx),
            tx: Arc::clone(&self.tx),
            cts: Arc::clone(&self.cts),
            peer_cts: Arc::clone(&self.peer_cts),
            timeout: self.timeout,
        }
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&self) -> Result<u32> {
        Ok(self.rx.buf.lock().len() as u32)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.buf.lock().clear();
        Ok(())
    }

    fn read_cts(&mut self) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        Ok(self.cts.load(Ordering::Acquire))
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(self.handle()))
    }

    fn close(&mut self) -> Result<()> {
        self.rx.close();
        self.tx.close();
        Ok(())
    }
}

impl Read for MemoryPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.pop(buf, self.timeout)
    }
}

impl Write for MemoryPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.push(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_connected_both_ways() {
        let (mut host, mut device) = MemoryPort::pair("mem");
        host.write_all_bytes(b"ID?\r\r").unwrap();
        assert_eq!(device.bytes_to_read().unwrap(), 5);

        let mut buf = [0u8; 16];
        let n = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ID?\r\r");

        device.write_all(b"0\n\r").unwrap();
        let n = host.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"0\n\r");
    }

    #[test]
    fn test_clear_buffers_drops_pending_input() {
        let (mut host, mut device) = MemoryPort::pair("mem");
        device.write_all(&[0xAA; 12]).unwrap();
        assert_eq!(host.bytes_to_read().unwrap(), 12);

        let mut reader = host.try_clone_port().unwrap();
        host.clear_buffers().unwrap();
        assert_eq!(reader.bytes_to_read().unwrap(), 0);

        device.write_all(b"0\n\r").unwrap();
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"0\n\r");
    }

    #[test]
    fn test_read_times_out_when_empty() {
        let (mut host, _device) = MemoryPort::pair("mem");
        host.set_timeout(Duration::from_millis(5)).unwrap();
        let mut buf = [0u8; 4];
        let err = host.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_close_ends_reads_and_fails_writes() {
        let (mut host, mut device) = MemoryPort::pair("mem");
        device.close().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(host.read(&mut buf).unwrap(), 0);
        assert!(host.write(b"x").is_err());
        assert!(host.read_cts().is_err());
    }

    #[test]
    fn test_peer_controls_clear_to_send() {
        let (mut host, device) = MemoryPort::pair("mem");
        assert!(host.read_cts().unwrap());
        device.set_request_to_send(false);
        assert!(!host.read_cts().unwrap());
    }

    #[test]
    fn test_clone_shares_stream() {
        let (host, mut device) = MemoryPort::pair("mem");
        let mut reader = host.try_clone_port().unwrap();
        device.write_all(b"abc").unwrap();
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }
}

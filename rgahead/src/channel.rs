//! Framing layer between the raw port and the state machine.
//!
//! A reader thread drains the port and turns each arrival into a protocol
//! unit according to the current [`ChannelMode`]:
//!
//! - `String`: bytes are decoded, accumulated, and split on `\r`. Each
//!   complete line, trimmed of the configured trailing characters, is
//!   handed to the line handler through the line [`DispatchQueue`].
//! - `Bytes`: each arrival is forwarded unsplit to the byte handler through
//!   a separate queue.
//!
//! Handlers never run on the reader thread.

use {
    crate::{
        dispatch::DispatchQueue,
        error::{Error, Result},
        port::Port,
    },
    log::{debug, error, trace},
    parking_lot::Mutex,
    std::{
        io::ErrorKind,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Line terminator used in both directions.
pub const LINE_TERMINATOR: char = '\r';

/// Characters stripped from the end of every received line.
pub const DEFAULT_TRIM_CHARS: &[char] = &['\n', '\r', ' ', '\0'];

/// Interval between clear-to-send polls.
const CTS_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Framing strategy for inbound data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChannelMode {
    /// Raw byte chunks.
    Bytes = 0,
    /// Delimited text lines.
    #[default]
    String = 1,
}

/// Shared, lock-free cell holding the current [`ChannelMode`].
#[derive(Debug, Clone)]
pub struct ModeCell(Arc<AtomicU8>);

impl Default for ModeCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeCell {
    /// Create a cell in `String` mode.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ChannelMode::String as u8)))
    }

    /// Current mode.
    pub fn get(&self) -> ChannelMode {
        match self.0.load(Ordering::Acquire) {
            0 => ChannelMode::Bytes,
            _ => ChannelMode::String,
        }
    }

    /// Switch mode.
    pub fn set(&self, mode: ChannelMode) {
        self.0.store(mode as u8, Ordering::Release);
    }
}

/// Accumulates text and splits it into terminated lines.
#[derive(Debug)]
pub struct LineFramer {
    pending_bytes: Vec<u8>,
    text: String,
    trim: Vec<char>,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_TRIM_CHARS)
    }
}

impl LineFramer {
    /// Create a framer trimming the given trailing characters.
    pub fn new(trim: &[char]) -> Self {
        Self {
            pending_bytes: Vec::new(),
            text: String::new(),
            trim: trim.to_vec(),
        }
    }

    /// Feed received bytes; returns every line completed by them.
    ///
    /// Partial text (and an incomplete UTF-8 suffix) stays buffered.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending_bytes.extend_from_slice(bytes);
        let decoded = drain_utf8_lossy(&mut self.pending_bytes);
        self.text.push_str(&decoded);

        let mut lines = Vec::new();
        while let Some(pos) = self.text.find(LINE_TERMINATOR) {
            let raw: String = self.text.drain(..=pos).collect();
            let line = raw.trim_end_matches(self.trim.as_slice());
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Text received after the last terminator.
    pub fn partial(&self) -> &str {
        &self.text
    }

    /// Drop all buffered input.
    pub fn reset(&mut self) {
        self.pending_bytes.clear();
        self.text.clear();
    }
}

/// Decode buffered bytes without stalling on invalid sequences.
///
/// Invalid bytes become `�`; an incomplete UTF-8 suffix stays in `buffer`.
fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }
                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Callback receiving one complete line.
pub type LineHandler = Arc<dyn Fn(String) + Send + Sync>;
/// Callback receiving one raw chunk.
pub type ByteHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
/// Callback told about every transmitted command.
pub type TransmitHandler = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback told about reader-thread I/O failures.
pub type FaultHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Consumers of channel traffic.
#[derive(Clone)]
pub struct ChannelHandlers {
    /// Receives lines in `String` mode.
    pub on_line: LineHandler,
    /// Receives chunks in `Bytes` mode.
    pub on_bytes: ByteHandler,
    /// Told about each command just before it is written.
    pub on_transmit: TransmitHandler,
    /// Told about reader failures.
    pub on_fault: FaultHandler,
}

/// Channel tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Trailing characters removed from received lines.
    pub trim_chars: Vec<char>,
    /// Upper bound on the clear-to-send wait before a write.
    pub cts_timeout: Duration,
    /// Read poll interval of the reader thread.
    pub read_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            trim_chars: DEFAULT_TRIM_CHARS.to_vec(),
            cts_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(50),
        }
    }
}

/// Queue depths for diagnostics.
#[derive(Debug, Clone)]
pub struct QueueDepths {
    line: Arc<AtomicUsize>,
    bytes: Arc<AtomicUsize>,
}

impl QueueDepths {
    /// Pending line jobs.
    pub fn lines(&self) -> usize {
        self.line.load(Ordering::Acquire)
    }

    /// Pending byte-chunk jobs.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }
}

/// Framed duplex channel over a [`Port`].
pub struct Channel {
    writer: Mutex<Box<dyn Port>>,
    name: String,
    mode: ModeCell,
    on_transmit: TransmitHandler,
    cts_timeout: Duration,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    depths: QueueDepths,
}

impl Channel {
    /// Start the reader thread and dispatch queues on `port`.
    pub fn open(
        mut port: Box<dyn Port>,
        mode: ModeCell,
        handlers: ChannelHandlers,
        config: &ChannelConfig,
    ) -> Result<Self> {
        let name = port.name().to_string();
        port.set_timeout(config.read_timeout)?;
        let mut reader_port = port.try_clone_port()?;
        reader_port.set_timeout(config.read_timeout)?;

        let line_queue = DispatchQueue::new(format!("{name}-lines"));
        let byte_queue = DispatchQueue::new(format!("{name}-bytes"));
        let depths = QueueDepths {
            line: line_queue.depth_handle(),
            bytes: byte_queue.depth_handle(),
        };

        let running = Arc::new(AtomicBool::new(true));
        let reader = Reader {
            port: reader_port,
            last_mode: mode.get(),
            mode: mode.clone(),
            framer: LineFramer::new(&config.trim_chars),
            line_queue,
            byte_queue,
            handlers: handlers.clone(),
            running: Arc::clone(&running),
        };
        let handle = thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn(move || reader.run())?;

        debug!("Channel open on {name}");
        Ok(Self {
            writer: Mutex::new(port),
            name,
            mode,
            on_transmit: handlers.on_transmit,
            cts_timeout: config.cts_timeout,
            running,
            reader: Mutex::new(Some(handle)),
            depths,
        })
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current framing mode.
    pub fn mode(&self) -> ChannelMode {
        self.mode.get()
    }

    /// Switch framing mode.
    pub fn set_mode(&self, mode: ChannelMode) {
        self.mode.set(mode);
    }

    /// Queue depths handle.
    pub fn depths(&self) -> QueueDepths {
        self.depths.clone()
    }

    /// Whether the channel is still open.
    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Transmit `text` followed by two line terminators.
    ///
    /// Waits (bounded) for clear-to-send, announces the command, then writes.
    pub fn send(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        let mut port = self.writer.lock();
        self.wait_clear_to_send(&mut **port)?;

        (self.on_transmit)(text);

        let mut frame = String::with_capacity(text.len() + 2);
        frame.push_str(text);
        frame.push(LINE_TERMINATOR);
        frame.push(LINE_TERMINATOR);
        trace!("TX {:?}", frame);
        port.write_all_bytes(frame.as_bytes())
    }

    fn wait_clear_to_send(&self, port: &mut dyn Port) -> Result<()> {
        let deadline = Instant::now() + self.cts_timeout;
        loop {
            if port.read_cts()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ClearToSendTimeout(self.cts_timeout));
            }
            thread::sleep(CTS_POLL_INTERVAL);
        }
    }

    /// Discard bytes the port received but the reader has not consumed.
    pub fn clear_input(&self) -> Result<()> {
        self.writer.lock().clear_buffers()
    }

    /// Stop the reader and close the port.
    pub fn close(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.writer.lock().close();
        if let Some(handle) = self.reader.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!("Channel closed on {}", self.name);
        result
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct Reader {
    port: Box<dyn Port>,
    mode: ModeCell,
    last_mode: ChannelMode,
    framer: LineFramer,
    line_queue: DispatchQueue,
    byte_queue: DispatchQueue,
    handlers: ChannelHandlers,
    running: Arc<AtomicBool>,
}

impl Reader {
    fn run(mut self) {
        let mut buf = [0u8; 4096];
        while self.running.load(Ordering::Acquire) {
            match self.port.read(&mut buf) {
                Ok(0) => {
                    debug!("Port {} reached end of stream", self.port.name());
                    break;
                },
                Ok(n) => self.deliver(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        error!("Read failed on {}: {e}", self.port.name());
                        (self.handlers.on_fault)(Error::Io(e));
                    }
                    break;
                },
            }
        }
        trace!("Reader for {} exiting", self.port.name());
    }

    fn deliver(&mut self, data: &[u8]) {
        let mode = self.mode.get();
        if mode == ChannelMode::String && self.last_mode == ChannelMode::Bytes {
            // Text received before the scan cannot continue after it.
            self.framer.reset();
        }
        self.last_mode = mode;
        match mode {
            ChannelMode::String => {
                for line in self.framer.push(data) {
                    trace!("RX line {line:?}");
                    let on_line = Arc::clone(&self.handlers.on_line);
                    self.line_queue.enqueue(move || on_line(line));
                }
            },
            ChannelMode::Bytes => {
                trace!("RX {} bytes", data.len());
                let chunk = data.to_vec();
                let on_bytes = Arc::clone(&self.handlers.on_bytes);
                self.byte_queue.enqueue(move || on_bytes(chunk));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MemoryPort;
    use std::io::{Read as _, Write as _};
    use std::sync::mpsc;

    #[test]
    fn test_framer_splits_on_carriage_return() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.push(b"SRSRGA200VER0.24\n\r0\n\r"), vec![
            "SRSRGA200VER0.24".to_string(),
            "0".to_string()
        ]);
        assert!(framer.partial().is_empty());
    }

    #[test]
    fn test_framer_keeps_partial_line() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"14").is_empty());
        assert_eq!(framer.partial(), "14");
        assert_eq!(framer.push(b"00\n\r29"), vec!["1400".to_string()]);
        assert_eq!(framer.partial(), "29");
    }

    #[test]
    fn test_framer_skips_empty_lines() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.push(b"\r\n\r7\r"), vec!["7".to_string()]);
    }

    #[test]
    fn test_framer_custom_trim() {
        let mut framer = LineFramer::new(&['#']);
        assert_eq!(framer.push(b"abc##\r"), vec!["abc".to_string()]);
    }

    #[test]
    fn test_drain_utf8_lossy_keeps_incomplete_suffix() {
        let mut buf = vec![b'a', 0xC3];
        assert_eq!(drain_utf8_lossy(&mut buf), "a");
        assert_eq!(buf, vec![0xC3]);
        buf.push(0xA9);
        assert_eq!(drain_utf8_lossy(&mut buf), "é");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_mode_cell_round_trip() {
        let mode = ModeCell::new();
        assert_eq!(mode.get(), ChannelMode::String);
        mode.set(ChannelMode::Bytes);
        assert_eq!(mode.get(), ChannelMode::Bytes);
    }

    enum Rx {
        Line(String),
        Bytes(Vec<u8>),
        Sent(String),
    }

    fn open_channel() -> (Channel, MemoryPort, mpsc::Receiver<Rx>) {
        let (host, device) = MemoryPort::pair("chan");
        let (tx, rx) = mpsc::channel();
        let (line_tx, bytes_tx, sent_tx) = (tx.clone(), tx.clone(), tx);
        let line_tx = Mutex::new(line_tx);
        let bytes_tx = Mutex::new(bytes_tx);
        let sent_tx = Mutex::new(sent_tx);
        let handlers = ChannelHandlers {
            on_line: Arc::new(move |l| {
                let _ = line_tx.lock().send(Rx::Line(l));
            }),
            on_bytes: Arc::new(move |b| {
                let _ = bytes_tx.lock().send(Rx::Bytes(b));
            }),
            on_transmit: Arc::new(move |t| {
                let _ = sent_tx.lock().send(Rx::Sent(t.to_string()));
            }),
            on_fault: Arc::new(|_| {}),
        };
        let config = ChannelConfig {
            read_timeout: Duration::from_millis(5),
            cts_timeout: Duration::from_millis(50),
            ..ChannelConfig::default()
        };
        let channel = Channel::open(Box::new(host), ModeCell::new(), handlers, &config).unwrap();
        (channel, device, rx)
    }

    #[test]
    fn test_send_announces_then_writes_double_terminator() {
        let (channel, mut device, rx) = open_channel();
        channel.send("FL1.0").unwrap();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Rx::Sent(t) => assert_eq!(t, "FL1.0"),
            _ => panic!("expected transmit notification"),
        }
        let mut buf = [0u8; 16];
        let n = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"FL1.0\r\r");
    }

    #[test]
    fn test_send_fails_when_cts_stays_low() {
        let (channel, device, _rx) = open_channel();
        device.set_request_to_send(false);
        let err = channel.send("ID?").unwrap_err();
        assert!(matches!(err, Error::ClearToSendTimeout(_)));
    }

    #[test]
    fn test_string_mode_delivers_lines() {
        let (_channel, mut device, rx) = open_channel();
        device.write_all(b"SRSRGA").unwrap();
        thread::sleep(Duration::from_millis(20));
        device.write_all(b"200\n\r0\n\r").unwrap();

        let mut lines = Vec::new();
        while lines.len() < 2 {
            if let Rx::Line(l) = rx.recv_timeout(Duration::from_secs(1)).unwrap() {
                lines.push(l);
            }
        }
        assert_eq!(lines, vec!["SRSRGA200".to_string(), "0".to_string()]);
    }

    #[test]
    fn test_bytes_mode_delivers_chunks_unsplit() {
        let (channel, mut device, rx) = open_channel();
        channel.set_mode(ChannelMode::Bytes);
        device.write_all(&[1, 0, 0, 0, b'\r', 2]).unwrap();

        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Rx::Bytes(b) => assert_eq!(b, vec![1, 0, 0, 0, b'\r', 2]),
            _ => panic!("expected byte chunk"),
        }
    }

    #[test]
    fn test_partial_text_dropped_across_bytes_mode() {
        let (channel, mut device, rx) = open_channel();
        device.write_all(b"12").unwrap();
        thread::sleep(Duration::from_millis(30));

        channel.set_mode(ChannelMode::Bytes);
        device.write_all(&[9, 0, 0, 0]).unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Rx::Bytes(_)
        ));

        channel.set_mode(ChannelMode::String);
        device.write_all(b"7\r").unwrap();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Rx::Line(l) => assert_eq!(l, "7"),
            _ => panic!("expected line"),
        }
    }

    #[test]
    fn test_clear_input_keeps_channel_usable() {
        let (channel, mut device, rx) = open_channel();
        channel.clear_input().unwrap();
        device.write_all(b"0\n\r").unwrap();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Rx::Line(l) => assert_eq!(l, "0"),
            _ => panic!("expected line"),
        }
    }

    #[test]
    fn test_send_after_close_fails() {
        let (channel, _device, _rx) = open_channel();
        channel.close().unwrap();
        assert!(!channel.is_open());
        assert!(matches!(channel.send("ID?"), Err(Error::ChannelClosed)));
    }
}

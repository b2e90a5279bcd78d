// Kitty graphics protocol detection: query the terminal, scan the reply
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use crate::config::{limits, protocol, Settings};
use crate::kitty_native::{TerminalConfigError, TerminalDevice, TerminalModeGuard, TtyDevice};
use crate::log_debug;
use crate::logger::hex_dump;

/// Outcome of one detection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub supported: bool,
    pub bytes_read: usize,
}

impl ProbeResult {
    fn unsupported(bytes_read: usize) -> Self {
        Self { supported: false, bytes_read }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Querying,
    Reading { budget: Duration, retries: u32 },
    Decided(ProbeResult),
}

/// What one wait-then-read round produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    TimedOut,
    Received(usize),
    WouldBlock,
    /// End of input or a read error
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOptions {
    pub initial_wait: Duration,
    pub followup_wait: Duration,
    pub would_block_sleep: Duration,
    pub max_would_block_retries: u32,
    pub require_escape_prefix: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ProbeOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            initial_wait: settings.initial_wait(),
            followup_wait: settings.followup_wait(),
            would_block_sleep: settings.would_block_sleep(),
            max_would_block_retries: settings.max_would_block_retries,
            require_escape_prefix: settings.require_escape_prefix,
        }
    }
}

/// Fixed-capacity accumulation buffer for the terminal's reply
pub struct ReplyBuffer {
    buf: [u8; limits::REPLY_BUFFER],
    filled: usize,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self { buf: [0; limits::REPLY_BUFFER], filled: 0 }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.buf.len()
    }

    /// Unfilled tail, where the next read lands
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.buf.len());
    }
}

impl Default for ReplyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `reply` holds the start of a graphics protocol response
pub fn contains_marker(reply: &[u8], require_escape_prefix: bool) -> bool {
    let marker = if require_escape_prefix {
        protocol::STRICT_REPLY_MARKER
    } else {
        protocol::REPLY_MARKER
    };
    reply.windows(marker.len()).any(|window| window == marker)
}

/// Advance the read loop by one event. No I/O happens here; `reply` is the
/// accumulated buffer after the event was applied to it.
pub fn step(
    state: ProbeState,
    event: ReadEvent,
    reply: &ReplyBuffer,
    options: &ProbeOptions,
) -> ProbeState {
    let ProbeState::Reading { budget, retries } = state else {
        return state;
    };

    let decided = |supported| {
        ProbeState::Decided(ProbeResult { supported, bytes_read: reply.len() })
    };

    match event {
        ReadEvent::TimedOut => decided(false),
        ReadEvent::Closed => decided(contains_marker(reply.bytes(), options.require_escape_prefix)),
        ReadEvent::WouldBlock => {
            if retries >= options.max_would_block_retries {
                decided(false)
            } else {
                // Sleep-and-retry leaves the wait budget alone
                ProbeState::Reading { budget, retries: retries + 1 }
            }
        }
        ReadEvent::Received(_) => {
            if contains_marker(reply.bytes(), options.require_escape_prefix) {
                decided(true)
            } else if reply.is_full() {
                decided(false)
            } else {
                ProbeState::Reading { budget: options.followup_wait, retries }
            }
        }
    }
}

/// Source of the would-block back-off sleep
pub trait Clock {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<C: Clock + ?Sized> Clock for &mut C {
    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration);
    }
}

pub struct ProtocolDetector<C: Clock = SystemClock> {
    options: ProbeOptions,
    clock: C,
    state: ProbeState,
}

impl ProtocolDetector<SystemClock> {
    pub fn new(options: ProbeOptions) -> Self {
        Self::with_clock(options, SystemClock)
    }
}

impl<C: Clock> ProtocolDetector<C> {
    pub fn with_clock(options: ProbeOptions, clock: C) -> Self {
        Self { options, clock, state: ProbeState::Idle }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Put `device` in raw mode, send the query to `output` and wait for a
    /// reply. Only a terminal that cannot be configured is an error; silence
    /// and I/O failures are an unsupported result.
    pub fn detect<D, W>(
        &mut self,
        device: D,
        output: &mut W,
    ) -> Result<ProbeResult, TerminalConfigError>
    where
        D: TerminalDevice,
        W: Write + ?Sized,
    {
        self.state = ProbeState::Idle;
        let mut guard = TerminalModeGuard::acquire(device)?;

        self.state = ProbeState::Querying;
        self.state = match send_query(output) {
            Ok(()) => ProbeState::Reading { budget: self.options.initial_wait, retries: 0 },
            Err(e) => {
                log_debug!("[PROBE] failed to send query: {}", e);
                ProbeState::Decided(ProbeResult::unsupported(0))
            }
        };

        let mut reply = ReplyBuffer::new();
        let result = loop {
            match self.state {
                ProbeState::Reading { budget, .. } => {
                    let event = read_event(&mut *guard, budget, &mut reply);
                    log_debug!(
                        "[PROBE] {:?} after waiting {:?} ({} bytes so far)",
                        event,
                        budget,
                        reply.len()
                    );

                    self.state = step(self.state, event, &reply, &self.options);
                    let still_reading = matches!(self.state, ProbeState::Reading { .. });
                    if event == ReadEvent::WouldBlock && still_reading {
                        self.clock.sleep(self.options.would_block_sleep);
                    }
                }
                ProbeState::Decided(result) => break result,
                ProbeState::Idle | ProbeState::Querying => {
                    self.state = ProbeState::Decided(ProbeResult::unsupported(reply.len()));
                }
            }
        };

        if !reply.is_empty() {
            log_debug!("[PROBE] reply:\n{}", hex_dump(reply.bytes()));
        }

        let drained = drain(&mut *guard);
        if drained > 0 {
            log_debug!("[PROBE] drained {} stray bytes", drained);
        }

        if let Err(e) = guard.release() {
            log_debug!("[PROBE] failed to restore terminal: {}", e);
        }

        log_debug!("[PROBE] supported={} bytes_read={}", result.supported, result.bytes_read);
        Ok(result)
    }
}

fn send_query<W: Write + ?Sized>(output: &mut W) -> io::Result<()> {
    output.write_all(protocol::QUERY)?;
    output.flush()
}

fn read_event<D: TerminalDevice>(
    device: &mut D,
    budget: Duration,
    reply: &mut ReplyBuffer,
) -> ReadEvent {
    match device.wait_readable(budget) {
        Ok(false) => ReadEvent::TimedOut,
        Ok(true) => match device.read(reply.spare_mut()) {
            Ok(0) => ReadEvent::Closed,
            Ok(n) => {
                reply.advance(n);
                ReadEvent::Received(n)
            }
            Err(e) if is_retryable(&e) => ReadEvent::WouldBlock,
            Err(e) => {
                log_debug!("[PROBE] read failed: {}", e);
                ReadEvent::Closed
            }
        },
        Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadEvent::WouldBlock,
        Err(e) => {
            log_debug!("[PROBE] wait failed: {}", e);
            ReadEvent::Closed
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Discard whatever is still pending so late reply bytes don't show up as
/// keyboard input. Returns the number of bytes thrown away.
fn drain<D: TerminalDevice>(device: &mut D) -> usize {
    let mut scratch = [0u8; limits::REPLY_BUFFER];
    let mut total = 0;
    for _ in 0..limits::DRAIN_READS {
        match device.read(&mut scratch) {
            Ok(n) if n > 0 => total += n,
            _ => break,
        }
    }
    total
}

/// Probe the controlling terminal on stdin, querying through stdout
pub fn is_kitty_protocol_supported(settings: &Settings) -> Result<bool, TerminalConfigError> {
    let mut detector = ProtocolDetector::new(ProbeOptions::from(settings));
    let mut stdout = io::stdout();
    let result = detector.detect(TtyDevice::stdin(), &mut stdout)?;
    Ok(result.supported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kitty_native::session_lock;
    use std::collections::VecDeque;

    enum Reply {
        Bytes(&'static [u8]),
        WouldBlock,
    }

    struct ScriptedTty {
        script: VecDeque<Reply>,
        pending: Option<&'static [u8]>,
        waits: Vec<Duration>,
        leftover: usize,
    }

    impl ScriptedTty {
        fn new(script: Vec<Reply>) -> Self {
            Self { script: script.into(), pending: None, waits: Vec::new(), leftover: 0 }
        }
    }

    impl TerminalDevice for ScriptedTty {
        fn get_attrs(&mut self) -> io::Result<libc::termios> {
            Ok(unsafe { std::mem::zeroed() })
        }
        fn set_attrs(&mut self, _attrs: &libc::termios) -> io::Result<()> {
            Ok(())
        }
        fn get_flags(&mut self) -> io::Result<libc::c_int> {
            Ok(0)
        }
        fn set_flags(&mut self, _flags: libc::c_int) -> io::Result<()> {
            Ok(())
        }
        fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
            self.waits.push(timeout);
            match self.script.pop_front() {
                None => Ok(false),
                Some(Reply::Bytes(bytes)) => {
                    self.pending = Some(bytes);
                    Ok(true)
                }
                Some(Reply::WouldBlock) => Ok(true),
            }
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.pending.take() {
                Some(bytes) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                None if self.leftover > 0 => {
                    let n = self.leftover.min(buf.len());
                    self.leftover -= n;
                    Ok(n)
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[derive(Default)]
    struct FakeClock {
        slept: Vec<Duration>,
    }

    impl Clock for FakeClock {
        fn sleep(&mut self, duration: Duration) {
            self.slept.push(duration);
        }
    }

    fn reading(budget_ms: u64) -> ProbeState {
        ProbeState::Reading { budget: Duration::from_millis(budget_ms), retries: 0 }
    }

    fn filled(bytes: &[u8]) -> ReplyBuffer {
        let mut reply = ReplyBuffer::new();
        let n = bytes.len().min(reply.spare_mut().len());
        reply.spare_mut()[..n].copy_from_slice(&bytes[..n]);
        reply.advance(n);
        reply
    }

    #[test]
    fn test_marker_scan() {
        assert!(contains_marker(b"\x1b_Gi=31;OK\x1b\\", false));
        assert!(contains_marker(b"junk_Gi", false));
        assert!(!contains_marker(b"_G", false));
        assert!(!contains_marker(b"\x1b[?62;c", false));

        assert!(contains_marker(b"\x1b_Gi=31;OK\x1b\\", true));
        assert!(!contains_marker(b"echoed _Gi text", true));
    }

    #[test]
    fn test_step_timeout_decides_unsupported() {
        let reply = ReplyBuffer::new();
        let next = step(reading(500), ReadEvent::TimedOut, &reply, &ProbeOptions::default());
        assert_eq!(next, ProbeState::Decided(ProbeResult { supported: false, bytes_read: 0 }));
    }

    #[test]
    fn test_step_marker_decides_supported() {
        let reply = filled(b"\x1b_Gi=31;OK\x1b\\");
        let next = step(reading(500), ReadEvent::Received(12), &reply, &ProbeOptions::default());
        assert_eq!(next, ProbeState::Decided(ProbeResult { supported: true, bytes_read: 12 }));
    }

    #[test]
    fn test_step_partial_reply_shrinks_budget() {
        let reply = filled(b"\x1b_");
        let next = step(reading(500), ReadEvent::Received(2), &reply, &ProbeOptions::default());
        assert_eq!(next, reading(50));
    }

    #[test]
    fn test_step_full_buffer_without_marker() {
        let reply = filled(&[b'x'; limits::REPLY_BUFFER]);
        assert!(reply.is_full());
        let next = step(reading(50), ReadEvent::Received(1), &reply, &ProbeOptions::default());
        assert_eq!(
            next,
            ProbeState::Decided(ProbeResult { supported: false, bytes_read: limits::REPLY_BUFFER })
        );
    }

    #[test]
    fn test_step_would_block_keeps_budget_until_cap() {
        let options = ProbeOptions { max_would_block_retries: 2, ..Default::default() };
        let reply = ReplyBuffer::new();

        let first = step(reading(500), ReadEvent::WouldBlock, &reply, &options);
        assert_eq!(first, ProbeState::Reading { budget: Duration::from_millis(500), retries: 1 });

        let second = step(first, ReadEvent::WouldBlock, &reply, &options);
        let third = step(second, ReadEvent::WouldBlock, &reply, &options);
        assert!(matches!(third, ProbeState::Decided(ProbeResult { supported: false, .. })));
    }

    #[test]
    fn test_step_closed_keeps_marker_already_read() {
        let reply = filled(b"\x1b_Gi=31;OK\x1b\\");
        let next = step(reading(50), ReadEvent::Closed, &reply, &ProbeOptions::default());
        assert_eq!(next, ProbeState::Decided(ProbeResult { supported: true, bytes_read: 12 }));
    }

    #[test]
    fn test_step_closed_without_marker() {
        let reply = filled(b"\x1b[?62;c");
        let next = step(reading(500), ReadEvent::Closed, &reply, &ProbeOptions::default());
        assert_eq!(next, ProbeState::Decided(ProbeResult { supported: false, bytes_read: 7 }));
    }

    #[test]
    fn test_step_ignores_settled_states() {
        let options = ProbeOptions::default();
        let reply = ReplyBuffer::new();
        let done = ProbeState::Decided(ProbeResult { supported: true, bytes_read: 3 });
        assert_eq!(step(done, ReadEvent::TimedOut, &reply, &options), done);
        assert_eq!(step(ProbeState::Idle, ReadEvent::Closed, &reply, &options), ProbeState::Idle);
    }

    fn detector() -> ProtocolDetector<FakeClock> {
        ProtocolDetector::with_clock(ProbeOptions::default(), FakeClock::default())
    }

    #[test]
    fn test_detect_reply_split_across_reads() {
        let _serial = session_lock();
        let mut tty =
            ScriptedTty::new(vec![Reply::Bytes(b"\x1b_"), Reply::Bytes(b"Gi=31;OK\x1b\\")]);
        let mut out = Vec::new();
        let mut detector = detector();

        let result = detector.detect(&mut tty, &mut out).unwrap();

        assert!(result.supported);
        assert_eq!(result.bytes_read, 12);
        assert_eq!(out, protocol::QUERY);
        assert_eq!(tty.waits, vec![Duration::from_millis(500), Duration::from_millis(50)]);
        assert_eq!(detector.state(), ProbeState::Decided(result));
    }

    #[test]
    fn test_detect_would_block_sleeps_and_retries() {
        let _serial = session_lock();
        let mut tty =
            ScriptedTty::new(vec![Reply::WouldBlock, Reply::Bytes(b"\x1b_Gi=31;OK\x1b\\")]);
        let mut clock = FakeClock::default();
        let mut out = Vec::new();

        let result = {
            let mut detector = ProtocolDetector::with_clock(ProbeOptions::default(), &mut clock);
            detector.detect(&mut tty, &mut out).unwrap()
        };

        assert!(result.supported);
        assert_eq!(clock.slept, vec![Duration::from_millis(10)]);
        assert_eq!(tty.waits, vec![Duration::from_millis(500), Duration::from_millis(500)]);
    }

    #[test]
    fn test_detect_drains_leftover_bytes() {
        let _serial = session_lock();
        let mut tty = ScriptedTty::new(vec![Reply::Bytes(b"\x1b_Gi=31;OK")]);
        tty.leftover = 300;
        let mut out = Vec::new();

        assert!(detector().detect(&mut tty, &mut out).unwrap().supported);
        assert_eq!(tty.leftover, 0);
    }
}

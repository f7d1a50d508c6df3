//! Status console on the second CDC ACM interface.
//!
//! The host gets a banner when it raises DTR and may type CR-terminated
//! commands: `status`, `version`, `help`.

use core::fmt::Write as _;

use heapless::{String, Vec};

pub const MAX_LINE_LEN: usize = 32;
pub const MAX_REPLY_LEN: usize = 128;

pub type Reply = String<MAX_REPLY_LEN>;

pub const BANNER: &str = "DAP42 status console\r\n";
const HELP: &str = "commands: status, version, help\r\n";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsoleCommand {
    Status,
    Version,
    Help,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsoleError {
    LineOverflow,
    /// The line is not valid UTF-8.
    Encoding,
    Unknown,
}

/// Accumulates one input line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    line: Vec<u8, MAX_LINE_LEN>,
    overflowed: bool,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self {
            line: Vec::new(),
            overflowed: false,
        }
    }

    /// Feeds one byte; CR or LF completes the line.
    ///
    /// Blank lines yield nothing.
    pub fn push(&mut self, byte: u8) -> Option<Result<ConsoleCommand, ConsoleError>> {
        match byte {
            b'\r' | b'\n' => {
                let overflowed = core::mem::take(&mut self.overflowed);
                let line = core::mem::take(&mut self.line);
                if overflowed {
                    return Some(Err(ConsoleError::LineOverflow));
                }
                let Ok(text) = core::str::from_utf8(&line) else {
                    return Some(Err(ConsoleError::Encoding));
                };
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                Some(parse(text))
            }
            _ => {
                if self.line.push(byte).is_err() {
                    self.overflowed = true;
                }
                None
            }
        }
    }
}

fn parse(text: &str) -> Result<ConsoleCommand, ConsoleError> {
    match text {
        "status" => Ok(ConsoleCommand::Status),
        "version" => Ok(ConsoleCommand::Version),
        "help" | "?" => Ok(ConsoleCommand::Help),
        _ => Err(ConsoleError::Unknown),
    }
}

/// Formats the reply to a completed line.
pub fn render(result: Result<ConsoleCommand, ConsoleError>, uptime_ms: u32) -> Reply {
    let mut reply = Reply::new();
    // Every reply fits MAX_REPLY_LEN.
    let _ = match result {
        Ok(ConsoleCommand::Status) => write!(
            reply,
            "uptime {}.{:03} s\r\n",
            uptime_ms / 1000,
            uptime_ms % 1000
        ),
        Ok(ConsoleCommand::Version) => {
            write!(reply, "{} {}\r\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        }
        Ok(ConsoleCommand::Help) => reply.write_str(HELP),
        Err(ConsoleError::LineOverflow) => reply.write_str("error: line too long\r\n"),
        Err(ConsoleError::Encoding) => reply.write_str("error: line is not valid UTF-8\r\n"),
        Err(ConsoleError::Unknown) => reply.write_str("error: unknown command\r\n"),
    };
    reply
}

#[cfg(target_os = "none")]
pub use channel::VirtualSerial;

#[cfg(target_os = "none")]
mod channel {
    use core::task::Poll;

    use embassy_futures::poll_once;
    use probe_core::supervisor::{HostEvents, Subsystem};
    use probe_core::tick::{TickCounter, TickSource};

    use super::{BANNER, LineBuffer, Reply, render};
    use crate::usb::{CdcAcmHandle, MAX_PACKET_SIZE};

    const PACKET: usize = MAX_PACKET_SIZE as usize;

    pub struct VirtualSerial {
        usb: CdcAcmHandle,
        clock: &'static TickCounter,
        input: LineBuffer,
        ingress: [u8; PACKET],
        outgoing: Reply,
        sent: usize,
        connected: bool,
    }

    impl VirtualSerial {
        pub fn new(usb: CdcAcmHandle, clock: &'static TickCounter) -> Self {
            Self {
                usb,
                clock,
                input: LineBuffer::new(),
                ingress: [0; PACKET],
                outgoing: Reply::new(),
                sent: 0,
                connected: false,
            }
        }

        fn queue(&mut self, text: &str) {
            if self.sent >= self.outgoing.len() {
                self.outgoing.clear();
                self.sent = 0;
            }
            if self.outgoing.push_str(text).is_err() {
                defmt::warn!("console: reply dropped");
            }
        }

        fn flush(&mut self) {
            let pending = &self.outgoing.as_bytes()[self.sent..];
            if pending.is_empty() {
                return;
            }
            let len = pending.len().min(PACKET);
            if let Poll::Ready(result) = poll_once(self.usb.sender.write_packet(&pending[..len])) {
                if result.is_err() {
                    // Port closed; drop whatever was queued.
                    self.sent = self.outgoing.len();
                } else {
                    self.sent += len;
                }
            }
        }
    }

    impl Subsystem for VirtualSerial {
        fn update<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
            let dtr = self.usb.sender.dtr();
            if dtr && !self.connected {
                defmt::info!("console: host connected");
                self.queue(BANNER);
            }
            self.connected = dtr;

            if let Poll::Ready(Ok(count)) =
                poll_once(self.usb.receiver.read_packet(&mut self.ingress))
            {
                if count > 0 {
                    events.on_activity();
                }
                let uptime = self.clock.now().raw();
                for index in 0..count {
                    if let Some(result) = self.input.push(self.ingress[index]) {
                        let reply = render(result, uptime);
                        self.queue(&reply);
                    }
                }
            }

            self.flush();
        }
    }
}

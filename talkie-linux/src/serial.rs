//! Serial line transport. The tty is opened non-blocking and put in raw
//! mode; bytes read from it go through the [`Framer`] to recover messages.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use talkie_core::transport::{Transport, TransportError};
use talkie_core::Framer;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    file: Option<File>,
    framer: Framer,
    pending: VecDeque<Vec<u8>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            file: None,
            framer: Framer::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Change line speed. An open line is reopened at the new rate; on
    /// failure the old one stays in use.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), TransportError> {
        speed(baud_rate).ok_or_else(|| unsupported(baud_rate))?;
        if self.file.is_some() {
            self.file = Some(open_line(&self.path, baud_rate)?);
            self.framer.reset();
            self.pending.clear();
        }
        log::info!("serial {} baud {} -> {}", self.path, self.baud_rate, baud_rate);
        self.baud_rate = baud_rate;
        Ok(())
    }

    /// Frames dropped for being longer than the framer buffer.
    pub fn overflows(&self) -> u64 {
        self.framer.overflows()
    }

    fn fill(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut chunk = [0u8; 256];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.pending.extend(self.framer.push(&chunk[..n])),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("serial read on {} failed: {}", self.path, e);
                    self.framer.reset();
                    break;
                }
            }
        }
    }
}

fn speed(baud_rate: u32) -> Option<libc::speed_t> {
    Some(match baud_rate {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        _ => return None,
    })
}

fn unsupported(baud_rate: u32) -> std::io::Error {
    std::io::Error::new(
        ErrorKind::InvalidInput,
        format!("unsupported baud rate {}", baud_rate),
    )
}

fn open_line(path: &str, baud_rate: u32) -> std::io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(path)?;
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid open descriptor owned by `file`; termios is plain data.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        // not a tty (pipe, pty fixture): use as a plain byte stream
        log::debug!("{} is not a terminal, skipping line setup", path);
        return Ok(file);
    }
    let speed = speed(baud_rate).ok_or_else(|| unsupported(baud_rate))?;
    unsafe {
        libc::cfmakeraw(&mut tio);
        libc::cfsetspeed(&mut tio, speed);
    }
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(file)
}

impl Transport for SerialTransport {
    /// A serial line has a single peer.
    type Address = ();

    fn open(&mut self) -> Result<(), TransportError> {
        if self.file.is_none() {
            self.file = Some(open_line(&self.path, self.baud_rate)?);
            self.framer.reset();
            log::debug!("serial {} open at {} baud", self.path, self.baud_rate);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
        self.framer.reset();
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn send(&mut self, bytes: &[u8], _to: Option<&()>) -> Result<(), TransportError> {
        let file = self.file.as_mut().ok_or(TransportError::Closed)?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn receive(&mut self) -> Option<(Vec<u8>, Option<()>)> {
        if self.pending.is_empty() {
            self.fill();
        }
        self.pending.pop_front().map(|frame| (frame, None))
    }

    fn port(&self) -> String {
        self.path.clone()
    }

    /// Switch device path. An open line is reopened on the new path first;
    /// on failure the old one stays in use.
    fn set_port(&mut self, port: &str) -> Result<(), TransportError> {
        if port.is_empty() {
            return Err(TransportError::InvalidPort(port.to_string()));
        }
        if self.file.is_some() {
            self.file = Some(open_line(port, self.baud_rate)?);
            self.framer.reset();
            self.pending.clear();
        }
        log::info!("serial port {} -> {}", self.path, port);
        self.path = port.to_string();
        Ok(())
    }

    fn describe(&self) -> String {
        let state = if self.is_open() { "open" } else { "closed" };
        format!(
            "Serial(port={}, baud={}, {}, overflows={})",
            self.path,
            self.baud_rate(),
            state,
            self.overflows()
        )
    }
}

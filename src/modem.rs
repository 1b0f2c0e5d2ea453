//! Serial AT command channel to a Quectel modem.
//!
//! A dedicated `std::thread` owns the serial fd (raw 115200 8N1, no echo)
//! and executes one command at a time; async callers submit requests over an
//! `mpsc` channel and await the reply on a `oneshot`. Blocking reads never
//! touch the tokio runtime.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Default AT command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUF_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    #[error("open {device}: {errno}")]
    Open { device: String, errno: Errno },
    #[error("serial setup: {0}")]
    Setup(String),
    #[error("serial I/O: {0}")]
    Io(String),
    #[error("timeout after {elapsed:.1?}, partial: {partial}")]
    Timeout { elapsed: Duration, partial: String },
    #[error("modem {0} I/O thread gone")]
    Closed(String),
}

impl ModemError {
    /// `true` when the device node exists but we may not open it.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            ModemError::Open {
                errno: Errno::EACCES | Errno::EPERM,
                ..
            }
        )
    }
}

struct AtRequest {
    command: String,
    timeout: Duration,
    reply: oneshot::Sender<Result<String, ModemError>>,
}

/// # Safety
/// `fd` must be a valid open file descriptor for as long as the borrow is used.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Cloneable handle to the modem's I/O thread.
#[derive(Clone)]
pub struct Modem {
    tx: mpsc::Sender<AtRequest>,
    device: String,
}

impl Modem {
    /// Open `device` (e.g. `/dev/ttyUSB2`), configure the line and spawn the
    /// I/O thread. Echo is disabled on the I/O thread, not here, so an
    /// unresponsive modem cannot stall the caller.
    pub fn open(device: &str) -> Result<Self, ModemError> {
        let fd = fcntl::open(
            device,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|errno| ModemError::Open {
            device: device.to_string(),
            errno,
        })?;

        if let Err(e) = set_blocking(fd).and_then(|()| configure_line(fd)) {
            let _ = unistd::close(fd);
            return Err(e);
        }

        let (tx, rx) = mpsc::channel::<AtRequest>(16);
        let name = device.to_string();
        std::thread::Builder::new()
            .name(format!("modem-{name}"))
            .spawn(move || io_thread(fd, rx, &name))
            .map_err(|e| ModemError::Setup(format!("spawn I/O thread: {e}")))?;

        info!("Modem {device}: opened (115200 8N1)");
        Ok(Self {
            tx,
            device: device.to_string(),
        })
    }

    /// Send an AT command with the default timeout (5s).
    pub async fn command(&self, cmd: &str) -> Result<String, ModemError> {
        self.command_with_timeout(cmd, DEFAULT_TIMEOUT).await
    }

    pub async fn command_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<String, ModemError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(AtRequest {
                command: cmd.to_string(),
                timeout,
                reply,
            })
            .await
            .map_err(|_| ModemError::Closed(self.device.clone()))?;
        reply_rx
            .await
            .map_err(|_| ModemError::Closed(self.device.clone()))?
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }
}

fn set_blocking(fd: RawFd) -> Result<(), ModemError> {
    let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)
        .map_err(|e| ModemError::Setup(format!("F_GETFL: {e}")))?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.remove(OFlag::O_NONBLOCK);
    fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags))
        .map_err(|e| ModemError::Setup(format!("F_SETFL: {e}")))?;
    Ok(())
}

/// Raw mode, 115200 baud, 8N1, no flow control, VMIN=0/VTIME=1 (reads return
/// after 100ms of silence).
fn configure_line(fd: RawFd) -> Result<(), ModemError> {
    let setup = |what: &str, e: Errno| ModemError::Setup(format!("{what}: {e}"));
    // SAFETY: fd was just opened by the caller and is still open
    let bfd = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(bfd).map_err(|e| setup("tcgetattr", e))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetispeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| setup("cfsetispeed", e))?;
    termios::cfsetospeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| setup("cfsetospeed", e))?;
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
    termios::tcsetattr(bfd, SetArg::TCSANOW, &tio).map_err(|e| setup("tcsetattr", e))?;
    termios::tcflush(bfd, termios::FlushArg::TCIOFLUSH).map_err(|e| setup("tcflush", e))?;
    Ok(())
}

fn io_thread(fd: RawFd, mut rx: mpsc::Receiver<AtRequest>, device: &str) {
    // Bare CR aborts any half-typed command, then turn echo off.
    // SAFETY: fd is owned by this thread until the close below
    let _ = unistd::write(unsafe { borrow_fd(fd) }, b"\r");
    std::thread::sleep(Duration::from_millis(100));
    match execute_at(fd, "ATE0", Duration::from_secs(2)) {
        Ok(_) => debug!("Modem {device}: echo disabled"),
        Err(e) => warn!("Modem {device}: ATE0 failed ({e}), continuing"),
    }

    while let Some(req) = rx.blocking_recv() {
        let result = execute_at(fd, &req.command, req.timeout);
        if let Err(e) = &result {
            warn!("Modem {device} {} failed: {e}", req.command);
        }
        let _ = req.reply.send(result);
    }

    debug!("Modem {device}: I/O thread exiting");
    let _ = unistd::close(fd);
}

/// Flush, write `command\r`, read until a final result code or `timeout`.
fn execute_at(fd: RawFd, command: &str, timeout: Duration) -> Result<String, ModemError> {
    // SAFETY: fd is owned by the I/O thread for its entire lifetime
    let bfd = unsafe { borrow_fd(fd) };
    termios::tcflush(bfd, termios::FlushArg::TCIOFLUSH)
        .map_err(|e| ModemError::Io(format!("tcflush: {e}")))?;
    unistd::write(bfd, format!("{command}\r").as_bytes())
        .map_err(|e| ModemError::Io(format!("write: {e}")))?;

    let started = Instant::now();
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut response = String::with_capacity(256);

    while !has_final_result(&response) {
        if started.elapsed() >= timeout {
            return Err(ModemError::Timeout {
                elapsed: started.elapsed(),
                partial: response.trim().to_string(),
            });
        }
        match unistd::read(fd, &mut buf) {
            Ok(0) | Err(Errno::EAGAIN) => {}
            Ok(n) => response.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e) => return Err(ModemError::Io(format!("read: {e}"))),
        }
    }

    Ok(strip_echo(&sanitize(&response)))
}

/// `OK`, `ERROR`, `+CME ERROR:` or `+CMS ERROR:` on a line of its own.
fn has_final_result(response: &str) -> bool {
    response.lines().map(str::trim).any(|line| {
        line == "OK"
            || line == "ERROR"
            || line.starts_with("+CME ERROR:")
            || line.starts_with("+CMS ERROR:")
    })
}

/// Drop NULs, control characters other than CR/LF, and U+FFFD left behind by
/// lossy decoding of stale buffer bytes.
fn sanitize(response: &str) -> String {
    response
        .chars()
        .filter(|&c| (c == '\r' || c == '\n' || !c.is_control()) && c != '\u{FFFD}')
        .collect()
}

/// Remove blank lines and echoed `AT...` command lines.
fn strip_echo(response: &str) -> String {
    response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            line.find(|c: char| c.is_ascii_alphabetic())
                .map_or(true, |pos| !line[pos..].starts_with("AT"))
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_result_codes() {
        assert!(has_final_result("+QGPSLOC: 1,2\r\nOK\r\n"));
        assert!(has_final_result("ERROR\r\n"));
        assert!(has_final_result("+CME ERROR: 516\r\n"));
        assert!(!has_final_result("+QGPSLOC: 1,2\r\n"));
        assert!(!has_final_result(""));
    }

    #[test]
    fn echo_and_garbage_are_removed() {
        let raw = "\x00AT+QGPSLOC=2\r\n+QGPSLOC: 153233.0,45.5,-73.5,1.2,47.0,3,270.5,0.0,0.0,260226,08\r\n\r\nOK\r\n";
        let cleaned = strip_echo(&sanitize(raw));
        assert_eq!(
            cleaned,
            "+QGPSLOC: 153233.0,45.5,-73.5,1.2,47.0,3,270.5,0.0,0.0,260226,08\r\nOK"
        );
    }

    #[test]
    fn replacement_chars_are_dropped() {
        assert_eq!(sanitize("\u{FFFD}OK\r\n"), "OK\r\n");
    }

    #[test]
    fn open_missing_device_fails() {
        let err = Modem::open("/nonexistent/ttyUSB9").err().unwrap();
        assert!(matches!(err, ModemError::Open { errno: Errno::ENOENT, .. }));
        assert!(!err.is_permission_denied());
    }
}

//! POSIX message queue link service: one message per segment.
//!
//! For links between processes on one host, e.g. flight software buses.
//! Enabled by the `pmq` feature.

use super::engine::Engine;
use super::span::OutboundSegment;
use crate::ipc::TaskArgs;
use crate::tools::error::{DtnError, Result};
use std::ffi::CString;

/// Queue depth requested at open.
pub const PMQLSA_MAXMSG: i64 = 10;

/// Largest segment a PMQ link can carry.
pub const PMQLSA_MSGSIZE: usize = 4096;

fn open_queue(name: &str) -> Result<libc::mqd_t> {
    let c_name = CString::new(name)
        .map_err(|_| DtnError::new(format!("Bad message queue name {:?}", name)))?;
    // mq_attr has private padding on some targets; zero it wholesale.
    let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
    attr.mq_flags = 0;
    attr.mq_maxmsg = PMQLSA_MAXMSG;
    attr.mq_msgsize = PMQLSA_MSGSIZE as i64;
    attr.mq_curmsgs = 0;
    let mq = unsafe {
        libc::mq_open(
            c_name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT,
            0o777,
            &attr as *const libc::mq_attr,
        )
    };
    if mq == -1 {
        return Err(DtnError::new(format!(
            "Can't open message queue {}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    Ok(mq)
}

/// Send one segment, retrying on EINTR.
fn send_segment(mq: libc::mqd_t, segment: &[u8]) -> Result<()> {
    loop {
        let result = unsafe {
            libc::mq_send(
                mq,
                segment.as_ptr() as *const libc::c_char,
                segment.len(),
                0,
            )
        };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err.into());
    }
}

/// PMQ link service output daemon for one span.
#[derive(Debug)]
pub struct PmqLso {
    mq: libc::mqd_t,
    name: String,
}

unsafe impl Send for PmqLso {}

impl PmqLso {
    /// Open (creating if necessary) the named queue.
    pub fn new(mq_name: &str) -> Result<PmqLso> {
        Ok(PmqLso {
            mq: open_queue(mq_name)?,
            name: mq_name.to_owned(),
        })
    }

    /// Drain the span's FIFO into the queue until stopped. Segments that
    /// exceed [`PMQLSA_MSGSIZE`] are rejected and dropped.
    pub fn run(&self, engine: &Engine, peer_engine: u64, args: &TaskArgs) {
        let span = match engine.span(peer_engine) {
            Ok(span) => span,
            Err(_) => return,
        };

        log::info!("pmqlso on {} running", self.name);
        while !args.stop_requested() {
            match span.dequeue_outbound_segment(engine.heap()) {
                Ok(OutboundSegment::Segment(wire)) => {
                    if wire.len() > PMQLSA_MSGSIZE {
                        log::error!(
                            "Segment of {} bytes exceeds PMQ message size, dropping",
                            wire.len()
                        );
                        continue;
                    }
                    if let Err(e) = send_segment(self.mq, &wire) {
                        log::warn!("pmqlso send failed, dropping segment: {}", e);
                    }
                }
                Ok(OutboundSegment::Interrupted) => continue,
                Ok(OutboundSegment::Stopped) => break,
                Err(e) => {
                    log::error!("pmqlso dequeue failed: {}", e);
                    break;
                }
            }
        }
        log::info!("pmqlso on {} stopped", self.name);
    }
}

impl Drop for PmqLso {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mq);
        }
    }
}

/// PMQ link service input daemon.
#[derive(Debug)]
pub struct PmqLsi {
    mq: libc::mqd_t,
    name: String,
}

unsafe impl Send for PmqLsi {}

impl PmqLsi {
    /// Open (creating if necessary) the named queue.
    pub fn new(mq_name: &str) -> Result<PmqLsi> {
        Ok(PmqLsi {
            mq: open_queue(mq_name)?,
            name: mq_name.to_owned(),
        })
    }

    /// Receive messages and hand each one to the engine until stopped.
    pub fn run(&self, engine: &Engine, args: &TaskArgs) {
        let mut buffer = vec![0u8; PMQLSA_MSGSIZE];
        log::info!("pmqlsi on {} running", self.name);
        while !args.stop_requested() {
            let timeout = libc::timespec {
                tv_sec: now_secs() + 1,
                tv_nsec: 0,
            };
            let n = unsafe {
                libc::mq_timedreceive(
                    self.mq,
                    buffer.as_mut_ptr() as *mut libc::c_char,
                    buffer.len(),
                    std::ptr::null_mut(),
                    &timeout as *const libc::timespec,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::ETIMEDOUT) => continue,
                    _ => {
                        log::error!("pmqlsi receive failed: {}", err);
                        break;
                    }
                }
            }
            if n == 0 {
                continue;
            }
            if let Err(e) = engine.handle_segment(&buffer[..n as usize]) {
                log::warn!("Discarding malformed segment: {}", e);
            }
        }
        log::info!("pmqlsi on {} stopped", self.name);
    }
}

impl Drop for PmqLsi {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mq);
        }
    }
}

fn now_secs() -> libc::time_t {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as libc::time_t)
}

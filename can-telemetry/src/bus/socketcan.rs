//! SocketCAN backend (Linux)

use super::BusBackend;
use crate::types::{now_ns, BusError, RawFrame};
use ::socketcan::{CanFrame, CanSocket, EmbeddedFrame, Id as CanId, Socket};
use std::io::ErrorKind;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    NonBlocking,
    Timeout(Duration),
}

/// Raw CAN socket bound to one interface
pub struct SocketCanBus {
    socket: CanSocket,
    channel: String,
    mode: Option<ReadMode>,
}

impl SocketCanBus {
    pub fn open(channel: &str) -> Result<Self, BusError> {
        let socket = CanSocket::open(channel).map_err(|e| BusError::DeviceUnavailable {
            interface: channel.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            socket,
            channel: channel.to_string(),
            mode: None,
        })
    }

    fn set_mode(&mut self, mode: ReadMode) -> Result<(), BusError> {
        if self.mode == Some(mode) {
            return Ok(());
        }
        match mode {
            ReadMode::NonBlocking => self.socket.set_nonblocking(true)?,
            ReadMode::Timeout(timeout) => {
                self.socket.set_nonblocking(false)?;
                self.socket.set_read_timeout(timeout)?;
            }
        }
        self.mode = Some(mode);
        Ok(())
    }
}

fn raw_id(id: CanId) -> (u32, bool) {
    match id {
        CanId::Standard(id) => (id.as_raw() as u32, false),
        CanId::Extended(id) => (id.as_raw(), true),
    }
}

fn to_raw_frame(frame: CanFrame) -> RawFrame {
    let ((can_id, extended), data, is_remote, is_error) = match &frame {
        CanFrame::Data(f) => (raw_id(f.id()), f.data().to_vec(), false, false),
        CanFrame::Remote(f) => (raw_id(f.id()), Vec::new(), true, false),
        CanFrame::Error(f) => (raw_id(f.id()), f.data().to_vec(), false, true),
    };

    let mut raw = RawFrame::new(can_id, data)
        .with_timestamp_ns(now_ns())
        .with_extended(extended);
    raw.is_remote_frame = is_remote;
    raw.is_error_frame = is_error;
    raw
}

impl BusBackend for SocketCanBus {
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawFrame>, BusError> {
        // A zero read timeout would block forever on Linux
        if timeout.is_zero() {
            self.set_mode(ReadMode::NonBlocking)?;
        } else {
            self.set_mode(ReadMode::Timeout(timeout))?;
        }

        match self.socket.read_frame() {
            Ok(frame) => Ok(Some(to_raw_frame(frame))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(BusError::Io(e)),
        }
    }

    fn close(&mut self) {
        log::debug!("Releasing SocketCAN interface {}", self.channel);
    }

    fn name(&self) -> &str {
        &self.channel
    }
}

//! SocketCAN transport (Linux only, `socketcan` feature).
//!
//! Implements the [`Transport`] boundary over a non-blocking SocketCAN
//! socket. Frame identifiers are transmitted as 29-bit extended ids; the bit
//! rate itself is configured at the link level (`ip link set canX ... bitrate
//! N`), so `open` verifies the interface rather than negotiating.

use std::time::Duration;

use async_trait::async_trait;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket};
use tokio::time::Instant;

use crate::bus::transport::Transport;
use crate::codec::frame::WireFrame;
use crate::core::error::{Error, Result};
use crate::core::transaction::Direction;

/// How often the receive path is polled while waiting for a reply.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Transport over a SocketCAN interface such as `can0` or `vcan0`.
pub struct SocketCanTransport {
    interface: String,
    socket: Option<CanSocket>,
}

impl SocketCanTransport {
    /// Bind to a SocketCAN interface by name. The socket is not opened
    /// until [`Transport::open`].
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            socket: None,
        }
    }

    fn socket(&self) -> Result<&CanSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::Transport(format!("interface {} not open", self.interface)))
    }

    fn discard_pending(socket: &CanSocket) {
        while socket.read_frame().is_ok() {}
    }
}

#[async_trait]
impl Transport for SocketCanTransport {
    fn adapter_id(&self) -> &str {
        &self.interface
    }

    async fn open(&mut self, bit_rate: u32) -> Result<()> {
        let socket = CanSocket::open(&self.interface).map_err(|e| {
            Error::Transport(format!(
                "failed to open CAN interface {}: {}",
                self.interface, e
            ))
        })?;
        socket.set_nonblocking(true).map_err(|e| {
            Error::Transport(format!("failed to set non-blocking mode: {}", e))
        })?;
        tracing::debug!(
            interface = %self.interface,
            bit_rate,
            "CAN socket opened (bit rate is set at the link level)"
        );
        self.socket = Some(socket);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.socket = None;
        tracing::debug!(interface = %self.interface, "CAN socket closed");
        Ok(())
    }

    async fn exchange(
        &mut self,
        frame: &WireFrame,
        timeout: Duration,
    ) -> Result<Option<WireFrame>> {
        let socket = self.socket()?;

        // Anything sitting in the receive buffer predates this request.
        Self::discard_pending(socket);

        let id = ExtendedId::new(frame.id).ok_or_else(|| {
            Error::Transport(format!("id 0x{:X} exceeds the 29-bit extended range", frame.id))
        })?;
        let can_frame = CanFrame::new(id, &frame.data)
            .ok_or_else(|| Error::Transport("payload exceeds the CAN frame limit".into()))?;
        socket
            .write_frame(&can_frame)
            .map_err(|e| Error::Transport(format!("CAN write failed: {}", e)))?;

        if frame.direction == Direction::Control {
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match socket.read_frame() {
                Ok(reply) => {
                    return Ok(Some(WireFrame {
                        id: reply.raw_id(),
                        direction: Direction::Monitor,
                        data: reply.data().to_vec(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(RX_POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(Error::Transport(format!("CAN read failed: {}", e)));
                }
            }
        }
    }

    async fn drain(&mut self) -> Result<()> {
        Self::discard_pending(self.socket()?);
        Ok(())
    }
}

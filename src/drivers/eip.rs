//! EtherNet/IP encapsulation layer shared by the CompactLogix and SLC 5/05
//! drivers.
//!
//! Implements just enough of the encapsulation protocol for unconnected
//! explicit messaging: RegisterSession / UnRegisterSession and SendRRData
//! with a two-item common packet (null address + unconnected data). Every
//! socket operation is guarded by the configured timeout.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::drivers::traits::{DriverError, DriverResult};

pub const EIP_PORT: u16 = 44818;

const CMD_REGISTER_SESSION: u16 = 0x0065;
const CMD_UNREGISTER_SESSION: u16 = 0x0066;
const CMD_SEND_RR_DATA: u16 = 0x006F;

const HEADER_LEN: usize = 24;
const ITEM_NULL_ADDRESS: u16 = 0x0000;
const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

pub(crate) struct EipSession {
    stream: TcpStream,
    session_handle: u32,
    io_timeout: Duration,
    sender_context: [u8; 8],
}

impl EipSession {
    /// Open a TCP connection and register an encapsulation session.
    pub async fn connect(host: &str, io_timeout: Duration) -> DriverResult<Self> {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{EIP_PORT}")
        };
        let stream = timeout(io_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DriverError::Timeout(io_timeout))?
            .map_err(|e| DriverError::Connect(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DriverError::Connect(e.to_string()))?;

        let mut session = EipSession {
            stream,
            session_handle: 0,
            io_timeout,
            sender_context: *b"plc-gwy\0",
        };

        // RegisterSession: protocol version 1, options 0. The peer assigns
        // the session handle in the reply header; roundtrip() records it.
        session
            .roundtrip(CMD_REGISTER_SESSION, &[0x01, 0x00, 0x00, 0x00])
            .await?;
        if session.session_handle == 0 {
            return Err(DriverError::Connect("no session handle assigned".into()));
        }
        debug!(handle = session.session_handle, "EIP session registered");
        Ok(session)
    }

    /// Send a CIP request via SendRRData and return the CIP reply payload.
    pub async fn send_rr_data(&mut self, cip: &[u8]) -> DriverResult<Vec<u8>> {
        // Interface handle (CIP = 0) + timeout, then the common packet.
        let mut data = Vec::with_capacity(16 + cip.len());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&10u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes()); // item count
        data.extend_from_slice(&ITEM_NULL_ADDRESS.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&ITEM_UNCONNECTED_DATA.to_le_bytes());
        data.extend_from_slice(&(cip.len() as u16).to_le_bytes());
        data.extend_from_slice(cip);

        let reply = self.roundtrip(CMD_SEND_RR_DATA, &data).await?;
        extract_unconnected_item(&reply)
    }

    /// Best effort; the peer drops the TCP connection either way.
    pub async fn unregister(&mut self) {
        let frame = encode_frame(
            CMD_UNREGISTER_SESSION,
            self.session_handle,
            &self.sender_context,
            &[],
        );
        let _ = timeout(self.io_timeout, self.stream.write_all(&frame)).await;
    }

    async fn roundtrip(&mut self, command: u16, data: &[u8]) -> DriverResult<Vec<u8>> {
        let frame = encode_frame(command, self.session_handle, &self.sender_context, data);
        timeout(self.io_timeout, self.stream.write_all(&frame))
            .await
            .map_err(|_| DriverError::Timeout(self.io_timeout))?
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        let mut header = [0u8; HEADER_LEN];
        timeout(self.io_timeout, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| DriverError::Timeout(self.io_timeout))?
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        let reply_command = u16::from_le_bytes([header[0], header[1]]);
        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let session = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let status = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if command == CMD_REGISTER_SESSION {
            self.session_handle = session;
        }
        if reply_command != command {
            return Err(DriverError::Transport(format!(
                "unexpected reply command 0x{reply_command:04x}"
            )));
        }
        if status != 0 {
            return Err(DriverError::Transport(format!(
                "encapsulation status 0x{status:08x}"
            )));
        }

        let mut body = vec![0u8; length];
        if length > 0 {
            timeout(self.io_timeout, self.stream.read_exact(&mut body))
                .await
                .map_err(|_| DriverError::Timeout(self.io_timeout))?
                .map_err(|e| DriverError::Transport(e.to_string()))?;
        }
        Ok(body)
    }
}

fn encode_frame(command: u16, session: u32, context: &[u8; 8], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
    frame.extend_from_slice(&session.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes()); // status
    frame.extend_from_slice(context);
    frame.extend_from_slice(&0u32.to_le_bytes()); // options
    frame.extend_from_slice(data);
    frame
}

fn extract_unconnected_item(body: &[u8]) -> DriverResult<Vec<u8>> {
    // interface handle (4) + timeout (2) + item count (2)
    if body.len() < 8 {
        return Err(DriverError::Transport("short SendRRData reply".into()));
    }
    let count = u16::from_le_bytes([body[6], body[7]]) as usize;
    let mut offset = 8;
    for _ in 0..count {
        if body.len() < offset + 4 {
            return Err(DriverError::Transport("truncated common packet".into()));
        }
        let item_type = u16::from_le_bytes([body[offset], body[offset + 1]]);
        let item_len = u16::from_le_bytes([body[offset + 2], body[offset + 3]]) as usize;
        offset += 4;
        if body.len() < offset + item_len {
            return Err(DriverError::Transport("truncated common packet item".into()));
        }
        if item_type == ITEM_UNCONNECTED_DATA {
            return Ok(body[offset..offset + item_len].to_vec());
        }
        offset += item_len;
    }
    Err(DriverError::Transport("no unconnected data item in reply".into()))
}

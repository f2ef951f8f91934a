//! CompactLogix driver: unconnected CIP Read Tag / Write Tag services over
//! the EtherNet/IP session layer. Tag addresses are plain symbolic member
//! paths (`Main.Temp`; array subscripts are not supported), encoded as
//! ANSI-extended symbol segments.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::drivers::eip::EipSession;
use crate::drivers::traits::{DriverError, DriverResult, PlcDriver, ReadOutcome};
use crate::tags::structures::{PlcName, TagValue};

const SERVICE_READ_TAG: u8 = 0x4C;
const SERVICE_WRITE_TAG: u8 = 0x4D;

// CIP elementary type codes.
const TYPE_BOOL: u16 = 0x00C1;
const TYPE_SINT: u16 = 0x00C2;
const TYPE_INT: u16 = 0x00C3;
const TYPE_DINT: u16 = 0x00C4;
const TYPE_LINT: u16 = 0x00C5;
const TYPE_REAL: u16 = 0x00CA;
const TYPE_LREAL: u16 = 0x00CB;

pub struct CompactLogixDriver {
    ip: String,
    io_timeout: Duration,
    session: Option<EipSession>,
}

impl CompactLogixDriver {
    pub fn new(ip: impl Into<String>, io_timeout: Duration) -> Self {
        CompactLogixDriver {
            ip: ip.into(),
            io_timeout,
            session: None,
        }
    }

    fn session(&mut self) -> DriverResult<&mut EipSession> {
        self.session.as_mut().ok_or(DriverError::NotConnected)
    }

    async fn read_one(&mut self, address: &str) -> DriverResult<TagValue> {
        let request = encode_read_tag(address)?;
        let session = self.session()?;
        let reply = session.send_rr_data(&request).await?;
        decode_read_reply(address, &reply)
    }
}

#[async_trait]
impl PlcDriver for CompactLogixDriver {
    fn plc(&self) -> PlcName {
        PlcName::Compactlogix
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    async fn connect(&mut self) -> DriverResult<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = EipSession::connect(&self.ip, self.io_timeout).await?;
        info!(ip = %self.ip, "CompactLogix connected");
        self.session = Some(session);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.unregister().await;
            debug!(ip = %self.ip, "CompactLogix disconnected");
        }
    }

    async fn read(&mut self, addresses: &[String]) -> DriverResult<ReadOutcome> {
        if self.session.is_none() {
            return Err(DriverError::NotConnected);
        }
        let mut out: ReadOutcome = HashMap::with_capacity(addresses.len());
        for address in addresses {
            match self.read_one(address).await {
                Ok(value) => {
                    out.insert(address.clone(), Ok(value));
                }
                // A transport-level failure poisons the whole batch; a CIP
                // status for one tag only poisons that address.
                Err(
                    e @ (DriverError::Transport(_)
                    | DriverError::Timeout(_)
                    | DriverError::NotConnected),
                ) => {
                    self.session = None;
                    return Err(e);
                }
                Err(e) => {
                    out.insert(address.clone(), Err(e));
                }
            }
        }
        Ok(out)
    }

    async fn write(&mut self, address: &str, value: &TagValue) -> DriverResult<()> {
        let request = encode_write_tag(address, value)?;
        let session = self.session()?;
        let reply = session.send_rr_data(&request).await?;
        check_write_reply(address, &reply)
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

/// Encode a symbolic request path (`Main.Temp` -> two ANSI segments).
fn encode_symbol_path(address: &str) -> DriverResult<Vec<u8>> {
    if address.is_empty() {
        return Err(DriverError::BadAddress(address.to_string()));
    }
    let mut path = Vec::new();
    for part in address.split('.') {
        if part.is_empty() || part.len() > u8::MAX as usize {
            return Err(DriverError::BadAddress(address.to_string()));
        }
        path.push(0x91); // ANSI extended symbol segment
        path.push(part.len() as u8);
        path.extend_from_slice(part.as_bytes());
        if part.len() % 2 == 1 {
            path.push(0x00); // pad to word boundary
        }
    }
    Ok(path)
}

fn encode_read_tag(address: &str) -> DriverResult<Vec<u8>> {
    let path = encode_symbol_path(address)?;
    let mut req = Vec::with_capacity(4 + path.len());
    req.push(SERVICE_READ_TAG);
    req.push((path.len() / 2) as u8);
    req.extend_from_slice(&path);
    req.extend_from_slice(&1u16.to_le_bytes()); // element count
    Ok(req)
}

fn encode_write_tag(address: &str, value: &TagValue) -> DriverResult<Vec<u8>> {
    let path = encode_symbol_path(address)?;
    let (type_code, data) = encode_value(value)?;
    let mut req = Vec::with_capacity(8 + path.len() + data.len());
    req.push(SERVICE_WRITE_TAG);
    req.push((path.len() / 2) as u8);
    req.extend_from_slice(&path);
    req.extend_from_slice(&type_code.to_le_bytes());
    req.extend_from_slice(&1u16.to_le_bytes()); // element count
    req.extend_from_slice(&data);
    Ok(req)
}

fn encode_value(value: &TagValue) -> DriverResult<(u16, Vec<u8>)> {
    match value {
        TagValue::Bool(b) => Ok((TYPE_BOOL, vec![if *b { 0xFF } else { 0x00 }])),
        TagValue::Int(i) => {
            let v = i32::try_from(*i)
                .map_err(|_| DriverError::Write(format!("{i} out of DINT range")))?;
            Ok((TYPE_DINT, v.to_le_bytes().to_vec()))
        }
        TagValue::Real(f) => Ok((TYPE_REAL, (*f as f32).to_le_bytes().to_vec())),
        // Exact decimals live in registers as REALs on the wire; the store
        // keeps the authoritative fixed-point form.
        TagValue::Decimal(d) => {
            let f = d.to_f64().unwrap_or(0.0);
            Ok((TYPE_REAL, (f as f32).to_le_bytes().to_vec()))
        }
        TagValue::Text(_) => Err(DriverError::Write(
            "STRING writes are not supported".to_string(),
        )),
    }
}

fn decode_read_reply(address: &str, reply: &[u8]) -> DriverResult<TagValue> {
    // service(1) + reserved(1) + general status(1) + extra status size(1)
    if reply.len() < 4 {
        return Err(DriverError::Read(format!("{address}: short CIP reply")));
    }
    if reply[0] != SERVICE_READ_TAG | 0x80 {
        return Err(DriverError::Read(format!(
            "{address}: unexpected reply service 0x{:02x}",
            reply[0]
        )));
    }
    let status = reply[2];
    if status != 0 {
        return Err(DriverError::Read(format!(
            "{address}: CIP status 0x{status:02x}"
        )));
    }
    let data = &reply[4 + reply[3] as usize * 2..];
    if data.len() < 2 {
        return Err(DriverError::Read(format!("{address}: missing type code")));
    }
    let type_code = u16::from_le_bytes([data[0], data[1]]);
    let raw = &data[2..];
    decode_typed_value(type_code, raw)
        .ok_or_else(|| DriverError::BadType(type_code))
}

fn decode_typed_value(type_code: u16, raw: &[u8]) -> Option<TagValue> {
    match type_code {
        TYPE_BOOL => Some(TagValue::Bool(*raw.first()? != 0)),
        TYPE_SINT => Some(TagValue::Int(i8::from_le_bytes([*raw.first()?]) as i64)),
        TYPE_INT => Some(TagValue::Int(
            i16::from_le_bytes(raw.get(..2)?.try_into().ok()?) as i64,
        )),
        TYPE_DINT => Some(TagValue::Int(
            i32::from_le_bytes(raw.get(..4)?.try_into().ok()?) as i64,
        )),
        TYPE_LINT => Some(TagValue::Int(i64::from_le_bytes(
            raw.get(..8)?.try_into().ok()?,
        ))),
        TYPE_REAL => Some(TagValue::Real(
            f32::from_le_bytes(raw.get(..4)?.try_into().ok()?) as f64,
        )),
        TYPE_LREAL => Some(TagValue::Real(f64::from_le_bytes(
            raw.get(..8)?.try_into().ok()?,
        ))),
        _ => None,
    }
}

fn check_write_reply(address: &str, reply: &[u8]) -> DriverResult<()> {
    if reply.len() < 4 {
        return Err(DriverError::Write(format!("{address}: short CIP reply")));
    }
    let status = reply[2];
    if status != 0 {
        return Err(DriverError::Write(format!(
            "{address}: CIP status 0x{status:02x}"
        )));
    }
    Ok(())
}

//! SLC 5/05 driver: DF1/PCCC commands carried over EtherNet/IP.
//!
//! The SLC family speaks PCCC (protected typed logical read/write with
//! three address fields) wrapped in the CIP "Execute PCCC" service against
//! the PCCC object. Addresses use data-file notation: `N7:0`, `F8:3`,
//! `B3:1` and an optional `/bit` suffix for binary files.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::drivers::eip::EipSession;
use crate::drivers::traits::{DriverError, DriverResult, PlcDriver, ReadOutcome};
use crate::tags::structures::{PlcName, TagValue};

const SERVICE_EXECUTE_PCCC: u8 = 0x4B;
// Request path to the PCCC object: class 0x67, instance 1.
const PCCC_OBJECT_PATH: [u8; 4] = [0x20, 0x67, 0x24, 0x01];

const CMD_TYPED: u8 = 0x0F;
const FNC_PROTECTED_TYPED_READ: u8 = 0xA2;
const FNC_PROTECTED_TYPED_WRITE: u8 = 0xAA;

/// A parsed SLC data-file address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlcAddress {
    pub file_type: FileType,
    pub file_number: u8,
    pub element: u16,
    pub bit: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// N file: 16-bit signed integers (type code 0x89).
    Integer,
    /// F file: 32-bit floats (type code 0x8A).
    Float,
    /// B file: bit words read as 16-bit integers (type code 0x85).
    Binary,
}

impl FileType {
    fn code(&self) -> u8 {
        match self {
            FileType::Integer => 0x89,
            FileType::Float => 0x8A,
            FileType::Binary => 0x85,
        }
    }

    fn element_bytes(&self) -> u8 {
        match self {
            FileType::Float => 4,
            _ => 2,
        }
    }
}

impl SlcAddress {
    /// Parse `N7:0`, `F8:3`, `B3:1/4`.
    pub fn parse(address: &str) -> DriverResult<Self> {
        let bad = || DriverError::BadAddress(address.to_string());
        let mut s = address.trim();
        let mut bit = None;
        if let Some((head, bit_str)) = s.split_once('/') {
            bit = Some(bit_str.parse::<u8>().map_err(|_| bad())?);
            if bit.unwrap() > 15 {
                return Err(bad());
            }
            s = head;
        }
        let (file_part, element_part) = s.split_once(':').ok_or_else(bad)?;
        let mut chars = file_part.chars();
        let kind = chars.next().ok_or_else(bad)?;
        let file_type = match kind.to_ascii_uppercase() {
            'N' => FileType::Integer,
            'F' => FileType::Float,
            'B' => FileType::Binary,
            _ => return Err(bad()),
        };
        if file_type == FileType::Float && bit.is_some() {
            return Err(bad());
        }
        let file_number = chars.as_str().parse::<u8>().map_err(|_| bad())?;
        let element = element_part.parse::<u16>().map_err(|_| bad())?;
        Ok(SlcAddress {
            file_type,
            file_number,
            element,
            bit,
        })
    }
}

pub struct Slc500Driver {
    ip: String,
    io_timeout: Duration,
    session: Option<EipSession>,
    /// DF1 transaction sequence, echoed back by the processor.
    tns: u16,
}

impl Slc500Driver {
    pub fn new(ip: impl Into<String>, io_timeout: Duration) -> Self {
        Slc500Driver {
            ip: ip.into(),
            io_timeout,
            session: None,
            tns: 0,
        }
    }

    fn next_tns(&mut self) -> u16 {
        self.tns = self.tns.wrapping_add(1);
        self.tns
    }

    async fn execute_pccc(&mut self, pccc: Vec<u8>) -> DriverResult<Vec<u8>> {
        let mut cip = Vec::with_capacity(2 + PCCC_OBJECT_PATH.len() + 7 + pccc.len());
        cip.push(SERVICE_EXECUTE_PCCC);
        cip.push((PCCC_OBJECT_PATH.len() / 2) as u8);
        cip.extend_from_slice(&PCCC_OBJECT_PATH);
        // Requestor ID: length, vendor, serial number.
        cip.push(0x07);
        cip.extend_from_slice(&0x0001u16.to_le_bytes());
        cip.extend_from_slice(&0x0000_0001u32.to_le_bytes());
        cip.extend_from_slice(&pccc);

        let session = self.session.as_mut().ok_or(DriverError::NotConnected)?;
        let reply = session.send_rr_data(&cip).await?;
        // CIP reply header, then the echoed requestor ID, then PCCC reply.
        if reply.len() < 4 {
            return Err(DriverError::Read("short PCCC reply".into()));
        }
        if reply[2] != 0 {
            return Err(DriverError::Read(format!("CIP status 0x{:02x}", reply[2])));
        }
        let body = &reply[4 + reply[3] as usize * 2..];
        if body.len() < 7 {
            return Err(DriverError::Read("short PCCC requestor echo".into()));
        }
        Ok(body[7..].to_vec())
    }

    async fn read_one(&mut self, address: &str) -> DriverResult<TagValue> {
        let addr = SlcAddress::parse(address)?;
        let tns = self.next_tns();
        let pccc = encode_typed_read(&addr, tns);
        let reply = self.execute_pccc(pccc).await?;
        decode_typed_read(address, &addr, &reply)
    }
}

#[async_trait]
impl PlcDriver for Slc500Driver {
    fn plc(&self) -> PlcName {
        PlcName::Slc500
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    async fn connect(&mut self) -> DriverResult<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = EipSession::connect(&self.ip, self.io_timeout).await?;
        info!(ip = %self.ip, "SLC 5/05 connected");
        self.session = Some(session);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.unregister().await;
            debug!(ip = %self.ip, "SLC 5/05 disconnected");
        }
    }

    async fn read(&mut self, addresses: &[String]) -> DriverResult<ReadOutcome> {
        if self.session.is_none() {
            return Err(DriverError::NotConnected);
        }
        // The SLC processors handle one protected typed read at a time.
        let mut out: ReadOutcome = HashMap::with_capacity(addresses.len());
        for address in addresses {
            match self.read_one(address).await {
                Ok(value) => {
                    out.insert(address.clone(), Ok(value));
                }
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
        let addr = SlcAddress::parse(address)?;
        let data = encode_write_data(&addr, value)?;
        let tns = self.next_tns();
        let pccc = encode_typed_write(&addr, &data, tns);
        let reply = self.execute_pccc(pccc).await?;
        check_pccc_status(address, &reply)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

fn encode_typed_read(addr: &SlcAddress, tns: u16) -> Vec<u8> {
    let mut pccc = Vec::with_capacity(11);
    pccc.push(CMD_TYPED);
    pccc.push(0x00); // status
    pccc.extend_from_slice(&tns.to_le_bytes());
    pccc.push(FNC_PROTECTED_TYPED_READ);
    pccc.push(addr.file_type.element_bytes());
    pccc.push(addr.file_number);
    pccc.push(addr.file_type.code());
    pccc.push(addr.element as u8);
    pccc.push(0x00); // sub-element
    pccc
}

fn encode_typed_write(addr: &SlcAddress, data: &[u8], tns: u16) -> Vec<u8> {
    let mut pccc = Vec::with_capacity(11 + data.len());
    pccc.push(CMD_TYPED);
    pccc.push(0x00);
    pccc.extend_from_slice(&tns.to_le_bytes());
    pccc.push(FNC_PROTECTED_TYPED_WRITE);
    pccc.push(data.len() as u8);
    pccc.push(addr.file_number);
    pccc.push(addr.file_type.code());
    pccc.push(addr.element as u8);
    pccc.push(0x00);
    pccc.extend_from_slice(data);
    pccc
}

fn check_pccc_status<'a>(address: &str, reply: &'a [u8]) -> DriverResult<&'a [u8]> {
    // cmd(1) + sts(1) + tns(2), then data.
    if reply.len() < 4 {
        return Err(DriverError::Read(format!("{address}: short PCCC frame")));
    }
    let sts = reply[1];
    if sts != 0 {
        return Err(DriverError::Read(format!(
            "{address}: PCCC status 0x{sts:02x}"
        )));
    }
    Ok(&reply[4..])
}

fn decode_typed_read(address: &str, addr: &SlcAddress, reply: &[u8]) -> DriverResult<TagValue> {
    let data = check_pccc_status(address, reply)?;
    match addr.file_type {
        FileType::Integer => {
            let raw: [u8; 2] = data
                .get(..2)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| DriverError::Read(format!("{address}: short integer data")))?;
            Ok(TagValue::Int(i16::from_le_bytes(raw) as i64))
        }
        FileType::Float => {
            let raw: [u8; 4] = data
                .get(..4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| DriverError::Read(format!("{address}: short float data")))?;
            Ok(TagValue::Real(f32::from_le_bytes(raw) as f64))
        }
        FileType::Binary => {
            let raw: [u8; 2] = data
                .get(..2)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| DriverError::Read(format!("{address}: short binary data")))?;
            let word = u16::from_le_bytes(raw);
            match addr.bit {
                Some(bit) => Ok(TagValue::Bool(word & (1 << bit) != 0)),
                None => Ok(TagValue::Int(word as i64)),
            }
        }
    }
}

fn encode_write_data(addr: &SlcAddress, value: &TagValue) -> DriverResult<Vec<u8>> {
    match (addr.file_type, value) {
        (FileType::Integer, TagValue::Int(i)) => {
            let v = i16::try_from(*i)
                .map_err(|_| DriverError::Write(format!("{i} out of N-file range")))?;
            Ok(v.to_le_bytes().to_vec())
        }
        (FileType::Float, TagValue::Real(f)) => Ok((*f as f32).to_le_bytes().to_vec()),
        (FileType::Float, TagValue::Decimal(d)) => {
            Ok((d.to_f64().unwrap_or(0.0) as f32).to_le_bytes().to_vec())
        }
        (FileType::Integer, TagValue::Decimal(d)) => {
            let v = d
                .to_i64()
                .and_then(|i| i16::try_from(i).ok())
                .ok_or_else(|| DriverError::Write(format!("{d} out of N-file range")))?;
            Ok(v.to_le_bytes().to_vec())
        }
        (FileType::Binary, TagValue::Bool(b)) => {
            // Whole-word write; bit-level masked writes need the
            // read-modify-write command, which the gateway does not issue.
            Ok((if *b { 1u16 } else { 0u16 }).to_le_bytes().to_vec())
        }
        (FileType::Binary, TagValue::Int(i)) => {
            let v = u16::try_from(*i)
                .map_err(|_| DriverError::Write(format!("{i} out of B-file range")))?;
            Ok(v.to_le_bytes().to_vec())
        }
        _ => Err(DriverError::Write(format!(
            "value {value:?} does not fit file type {:?}",
            addr.file_type
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_addresses() {
        assert_eq!(
            SlcAddress::parse("N7:0").unwrap(),
            SlcAddress {
                file_type: FileType::Integer,
                file_number: 7,
                element: 0,
                bit: None
            }
        );
        assert_eq!(
            SlcAddress::parse("F8:3").unwrap(),
            SlcAddress {
                file_type: FileType::Float,
                file_number: 8,
                element: 3,
                bit: None
            }
        );
        assert_eq!(
            SlcAddress::parse("B3:1/4").unwrap(),
            SlcAddress {
                file_type: FileType::Binary,
                file_number: 3,
                element: 1,
                bit: Some(4)
            }
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "N7", "X7:0", "N7:a", "F8:3/2", "B3:1/16"] {
            assert!(SlcAddress::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn typed_read_frame_layout() {
        let addr = SlcAddress::parse("N7:2").unwrap();
        let pccc = encode_typed_read(&addr, 0x1234);
        assert_eq!(pccc[0], CMD_TYPED);
        assert_eq!(&pccc[2..4], &0x1234u16.to_le_bytes());
        assert_eq!(pccc[4], FNC_PROTECTED_TYPED_READ);
        assert_eq!(pccc[5], 2); // bytes per element
        assert_eq!(pccc[6], 7); // file number
        assert_eq!(pccc[7], 0x89); // N-file type code
        assert_eq!(pccc[8], 2); // element
    }

    #[test]
    fn integer_reply_decodes() {
        let addr = SlcAddress::parse("N7:0").unwrap();
        let mut reply = vec![0x4F, 0x00, 0x34, 0x12];
        reply.extend_from_slice(&(-7i16).to_le_bytes());
        assert_eq!(
            decode_typed_read("N7:0", &addr, &reply).unwrap(),
            TagValue::Int(-7)
        );
    }

    #[test]
    fn bit_reply_extracts_single_bit() {
        let addr = SlcAddress::parse("B3:0/3").unwrap();
        let mut reply = vec![0x4F, 0x00, 0x00, 0x00];
        reply.extend_from_slice(&0b0000_1000u16.to_le_bytes());
        assert_eq!(
            decode_typed_read("B3:0/3", &addr, &reply).unwrap(),
            TagValue::Bool(true)
        );
    }

    #[test]
    fn nonzero_status_is_an_error() {
        let addr = SlcAddress::parse("N7:0").unwrap();
        let reply = vec![0x4F, 0x10, 0x00, 0x00];
        assert!(decode_typed_read("N7:0", &addr, &reply).is_err());
    }
}

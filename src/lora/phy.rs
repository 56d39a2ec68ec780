//! PHY payload: `MHDR (1) | MACPayload (n) | MIC (4, little-endian)`.

use crate::error::EngineError;
use crate::lora::{parse_hexadecimal, MessageDirection, MessageType};

#[derive(Debug, Clone)]
pub struct PhyPayload {
    buffer: Vec<u8>,
    mhdr: u8,
    message_type: MessageType,
    rfu: u8,
    major: u8,
    mic: u32,
}

impl PhyPayload {
    pub fn from_buffer(buffer: impl Into<Vec<u8>>) -> Result<Self, EngineError> {
        let buffer = buffer.into();
        if buffer.len() < 5 {
            return Err(EngineError::Protocol(format!(
                "too short physical payload: {} bytes",
                buffer.len()
            )));
        }

        let mhdr = buffer[0];
        let mic_offset = buffer.len() - 4;
        let mic = u32::from_le_bytes([
            buffer[mic_offset],
            buffer[mic_offset + 1],
            buffer[mic_offset + 2],
            buffer[mic_offset + 3],
        ]);

        Ok(PhyPayload {
            message_type: MessageType::from_mhdr(mhdr),
            rfu: (mhdr >> 2) & 0x07,
            major: mhdr & 0x03,
            mic,
            mhdr,
            buffer,
        })
    }

    pub fn parse_hexadecimal(message: &str) -> Result<Self, EngineError> {
        Self::from_buffer(parse_hexadecimal(message)?)
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn mhdr(&self) -> u8 {
        self.mhdr
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn direction(&self) -> Result<MessageDirection, EngineError> {
        self.message_type.direction()
    }

    pub fn rfu(&self) -> u8 {
        self.rfu
    }

    pub fn major(&self) -> u8 {
        self.major
    }

    /// The frame's MIC, decoded as a little-endian u32.
    pub fn mic(&self) -> u32 {
        self.mic
    }

    pub fn has_mac_payload(&self) -> bool {
        self.message_type.has_mac_payload()
    }

    pub fn mac_payload(&self) -> Result<&[u8], EngineError> {
        if self.has_mac_payload() {
            Ok(&self.buffer[1..self.buffer.len() - 4])
        } else {
            Err(EngineError::Protocol("no MAC payload".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::format_hexadecimal;

    #[test]
    fn test_parse_unconfirmed_uplink() {
        let phy = PhyPayload::parse_hexadecimal("40C51C012600010001FC98BDB0D4C6").unwrap();

        assert_eq!(
            format_hexadecimal(phy.buffer(), true),
            "40C51C012600010001FC98BDB0D4C6"
        );
        assert_eq!(phy.mhdr(), 0x40);
        assert_eq!(phy.message_type(), MessageType::UnconfirmedDataUp);
        assert_eq!(phy.direction().unwrap(), MessageDirection::Uplink);
        assert_eq!(phy.rfu(), 0);
        assert_eq!(phy.major(), 0);
        assert_eq!(phy.mic(), u32::from_le_bytes([0xBD, 0xB0, 0xD4, 0xC6]));
        assert!(phy.has_mac_payload());
        assert_eq!(phy.mac_payload().unwrap().len(), 10);
        assert_eq!(
            format_hexadecimal(phy.mac_payload().unwrap(), true),
            "C51C012600010001FC98"
        );
    }

    #[test]
    fn test_mic_is_little_endian() {
        let phy = PhyPayload::parse_hexadecimal("40F17DBE4900020001954378762B11FF0D").unwrap();
        assert_eq!(phy.mic(), 0x0DFF112B);
    }

    #[test]
    fn test_too_short_frame() {
        assert!(PhyPayload::parse_hexadecimal("40FFFFFF").is_err());
    }

    #[test]
    fn test_join_request_has_no_mac_payload() {
        let phy = PhyPayload::parse_hexadecimal("000102030405").unwrap();
        assert_eq!(phy.message_type(), MessageType::JoinRequest);
        assert!(phy.mac_payload().is_err());
    }
}

//! LoRaWAN 1.0.x frame codec: PHY/MAC layers, MIC verification (AES-CMAC)
//! and payload encryption (AES-CTR).

pub mod keys;
pub mod mac;
pub mod phy;

pub use keys::SessionKey;
pub use mac::MacPayload;
pub use phy::PhyPayload;

use crate::error::EngineError;

/// MHDR message types (MHDR bits 7..5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    Reserved,
    Proprietary,
}

impl MessageType {
    pub fn from_mhdr(mhdr: u8) -> MessageType {
        match mhdr >> 5 {
            0 => MessageType::JoinRequest,
            1 => MessageType::JoinAccept,
            2 => MessageType::UnconfirmedDataUp,
            3 => MessageType::UnconfirmedDataDown,
            4 => MessageType::ConfirmedDataUp,
            5 => MessageType::ConfirmedDataDown,
            6 => MessageType::Reserved,
            _ => MessageType::Proprietary,
        }
    }

    /// Whether the frame carries a MAC payload (data frames only).
    pub fn has_mac_payload(self) -> bool {
        matches!(
            self,
            MessageType::UnconfirmedDataUp
                | MessageType::UnconfirmedDataDown
                | MessageType::ConfirmedDataUp
                | MessageType::ConfirmedDataDown
        )
    }

    pub fn direction(self) -> Result<MessageDirection, EngineError> {
        match self {
            MessageType::JoinRequest
            | MessageType::UnconfirmedDataUp
            | MessageType::ConfirmedDataUp => Ok(MessageDirection::Uplink),
            MessageType::JoinAccept
            | MessageType::UnconfirmedDataDown
            | MessageType::ConfirmedDataDown => Ok(MessageDirection::Downlink),
            _ => Err(EngineError::Protocol(
                "no direction for reserved/proprietary frames".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Uplink,
    Downlink,
}

impl MessageDirection {
    /// Direction byte used in the crypto blocks.
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            MessageDirection::Uplink => 0x00,
            MessageDirection::Downlink => 0x01,
        }
    }
}

fn hex_value(c: u8) -> Result<u8, EngineError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(EngineError::BadInput(format!(
            "not an hexadecimal character: {}",
            c as char
        ))),
    }
}

/// Decodes an even-length hexadecimal string.
pub fn parse_hexadecimal(message: &str) -> Result<Vec<u8>, EngineError> {
    let bytes = message.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(EngineError::BadInput(
            "the number of hexadecimal characters must be even".to_string(),
        ));
    }

    let mut buffer = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        buffer.push(hex_value(pair[0])? * 16 + hex_value(pair[1])?);
    }
    Ok(buffer)
}

/// Encodes bytes as hexadecimal characters.
pub fn format_hexadecimal(buffer: &[u8], upcase: bool) -> String {
    let mut result = String::with_capacity(buffer.len() * 2);
    for byte in buffer {
        if upcase {
            result.push_str(&format!("{:02X}", byte));
        } else {
            result.push_str(&format!("{:02x}", byte));
        }
    }
    result
}

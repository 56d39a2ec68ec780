//! MAC payload of data frames:
//! `DevAddr (4, LE) | FCtrl (1) | FCnt (2, LE) | FOpts (0..15) | [FPort (1) | FRMPayload]`.

use crate::error::EngineError;
use crate::lora::{MessageDirection, PhyPayload};

fn has_bit(value: u8, bit: u8) -> bool {
    debug_assert!(bit <= 7);
    value & (1 << bit) != 0
}

#[derive(Debug, Clone)]
pub struct MacPayload {
    buffer: Vec<u8>,
    device_address: u32,
    fctrl: u8,
    frame_counter: u16,
    fopts_length: usize,
    frame_offset: usize,
    frame_size: usize,
    fport: u8,
}

impl MacPayload {
    pub fn from_buffer(buffer: impl Into<Vec<u8>>) -> Result<Self, EngineError> {
        let buffer = buffer.into();
        if buffer.len() < 7 {
            // DevAddr (4) + FCtrl (1) + FCnt (2) are mandatory
            return Err(EngineError::Protocol(format!(
                "too short MAC payload: {} bytes",
                buffer.len()
            )));
        }

        let device_address = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let fctrl = buffer[4];
        let frame_counter = u16::from_le_bytes([buffer[5], buffer[6]]);
        let fopts_length = (fctrl & 0x0f) as usize;

        let mut frame_offset = 7 + fopts_length;
        let frame_size;
        let fport;

        if buffer.len() < frame_offset {
            return Err(EngineError::Protocol(
                "MAC payload too short for its FOpts field".to_string(),
            ));
        } else if buffer.len() == frame_offset {
            // No FPort, no frame payload (allowed by the standard)
            frame_size = 0;
            fport = 0;
        } else {
            fport = buffer[frame_offset];
            frame_offset += 1; // skip the FPort field
            frame_size = buffer.len() - frame_offset;
        }

        Ok(MacPayload {
            device_address,
            fctrl,
            frame_counter,
            fopts_length,
            frame_offset,
            frame_size,
            fport,
            buffer,
        })
    }

    pub fn from_phy(phy: &PhyPayload) -> Result<Self, EngineError> {
        Self::from_buffer(phy.mac_payload()?.to_vec())
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn device_address(&self) -> u32 {
        self.device_address
    }

    pub fn fctrl(&self) -> u8 {
        self.fctrl
    }

    pub fn frame_counter(&self) -> u16 {
        self.frame_counter
    }

    pub fn fopts_length(&self) -> usize {
        self.fopts_length
    }

    pub fn fopts(&self) -> &[u8] {
        &self.buffer[7..7 + self.fopts_length]
    }

    pub fn fport(&self) -> u8 {
        self.fport
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame_payload(&self) -> &[u8] {
        &self.buffer[self.frame_offset..self.frame_offset + self.frame_size]
    }

    /// The frame header: `DevAddr | FCtrl | FCnt | FOpts`.
    pub fn fhdr(&self) -> &[u8] {
        &self.buffer[..7 + self.fopts_length]
    }

    /// ADR flag (same bit location for uplink and downlink).
    pub fn has_adr(&self) -> bool {
        has_bit(self.fctrl, 7)
    }

    /// ACK flag (same bit location for uplink and downlink).
    pub fn has_ack(&self) -> bool {
        has_bit(self.fctrl, 5)
    }

    pub fn has_rfu(&self, direction: MessageDirection) -> bool {
        match direction {
            MessageDirection::Downlink => has_bit(self.fctrl, 6),
            MessageDirection::Uplink => has_bit(self.fctrl, 4),
        }
    }

    /// Only meaningful for downlink frames.
    pub fn frame_pending(&self, direction: MessageDirection) -> Result<bool, EngineError> {
        match direction {
            MessageDirection::Downlink => Ok(has_bit(self.fctrl, 4)),
            MessageDirection::Uplink => Err(EngineError::Protocol(
                "FPending is only available for downlink frames".to_string(),
            )),
        }
    }

    /// Only meaningful for uplink frames.
    pub fn has_adr_ack_req(&self, direction: MessageDirection) -> Result<bool, EngineError> {
        match direction {
            MessageDirection::Uplink => Ok(has_bit(self.fctrl, 6)),
            MessageDirection::Downlink => Err(EngineError::Protocol(
                "ADRACKReq is only available for uplink frames".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::format_hexadecimal;

    #[test]
    fn test_parse_with_payload() {
        let phy = PhyPayload::parse_hexadecimal("40F17DBE4900020001954378762B11FF0D").unwrap();
        let mac = MacPayload::from_phy(&phy).unwrap();

        assert_eq!(
            format_hexadecimal(mac.buffer(), true),
            "F17DBE490002000195437876"
        );
        assert_eq!(mac.device_address(), 0x49BE7DF1);
        assert_eq!(mac.fctrl(), 0);
        assert_eq!(mac.frame_counter(), 2);
        assert_eq!(mac.fopts_length(), 0);
        assert!(mac.fopts().is_empty());
        assert_eq!(mac.fport(), 1);
        assert_eq!(mac.frame_size(), 4);
        assert_eq!(format_hexadecimal(mac.frame_payload(), true), "95437876");
        assert_eq!(format_hexadecimal(mac.fhdr(), true), "F17DBE49000200");

        assert!(!mac.has_adr());
        assert!(!mac.has_ack());
        assert!(!mac.has_rfu(MessageDirection::Uplink));
        assert!(!mac.has_adr_ack_req(MessageDirection::Uplink).unwrap());
        assert!(mac.frame_pending(MessageDirection::Uplink).is_err());
    }

    #[test]
    fn test_parse_empty_payload() {
        // FPort present, zero-length FRMPayload
        let phy = PhyPayload::parse_hexadecimal("40F17DBE49000300012A3518AF").unwrap();
        let mac = MacPayload::from_phy(&phy).unwrap();

        assert_eq!(format_hexadecimal(mac.buffer(), true), "F17DBE4900030001");
        assert_eq!(mac.frame_counter(), 3);
        assert_eq!(mac.fport(), 1);
        assert_eq!(mac.frame_size(), 0);
        assert!(mac.frame_payload().is_empty());
        assert_eq!(format_hexadecimal(mac.fhdr(), true), "F17DBE49000300");
    }

    #[test]
    fn test_parse_without_fport() {
        // MAC payload of exactly 7 bytes: no FPort, no payload
        let mac = MacPayload::from_buffer(vec![0xf1, 0x7d, 0xbe, 0x49, 0x00, 0x05, 0x00]).unwrap();
        assert_eq!(mac.fport(), 0);
        assert_eq!(mac.frame_size(), 0);
        assert_eq!(mac.fhdr().len(), 7);
    }

    #[test]
    fn test_too_short_for_fopts() {
        // FCtrl declares 4 FOpts bytes but only 1 follows
        let mac = MacPayload::from_buffer(vec![1, 2, 3, 4, 0x04, 0, 0, 9]);
        assert!(mac.is_err());
    }
}

//! LoRaWAN uplink decoder filter: verifies the MIC of each incoming PHY
//! frame and appends the decrypted FRMPayload to the output series.

use crate::error::EngineError;
use crate::filter::adapter::{AdapterFilter, Push, PushStatus};
use crate::lora::{format_hexadecimal, MacPayload, PhyPayload, SessionKey};
use crate::manager::TimeSeriesManager;
use crate::telemetry::{EngineEvent, EngineEventListener};
use crate::types::Message;
use crate::writer::TimeSeriesWriter;
use std::sync::Arc;

pub struct LoRaDecoderPusher {
    filter_name: String,
    writer: TimeSeriesWriter,
    nwk_skey: SessionKey,
    app_skey: SessionKey,
    events: Arc<dyn EngineEventListener>,
}

impl LoRaDecoderPusher {
    fn decode(&self, message: &Message) -> Result<(u32, Vec<u8>), EngineError> {
        let phy = PhyPayload::from_buffer(message.value().to_vec())?;
        let mac = MacPayload::from_phy(&phy)?;

        if !self.nwk_skey.check_mic(&phy, 0) {
            return Err(EngineError::Protocol(format!(
                "bad MIC for packet from device {:08X}",
                mac.device_address()
            )));
        }

        // FPort 0 addresses the MAC layer, whose payload is encrypted with
        // the network session key; application traffic uses the app key.
        let key = if mac.fport() == 0 {
            &self.nwk_skey
        } else {
            &self.app_skey
        };

        let plaintext = key.apply_frame(&phy, 0)?;
        Ok((mac.device_address(), plaintext))
    }
}

impl Push for LoRaDecoderPusher {
    fn push(&mut self, message: &Message) -> Result<PushStatus, EngineError> {
        match self.decode(message) {
            Ok((device_address, plaintext)) => {
                let mut output = Message::default();
                if let Some(timestamp) = message.timestamp() {
                    output.set_timestamp(timestamp);
                }
                // The device address identifies the source of the item.
                output.set_metadata(format!("{:08X}", device_address));
                output.set_value(plaintext);

                if self.writer.append(&output) {
                    Ok(PushStatus::Success)
                } else {
                    Ok(PushStatus::Failure)
                }
            }
            Err(e) => {
                self.events.on_event(EngineEvent::MessageDiscarded {
                    filter: self.filter_name.clone(),
                    reason: format!(
                        "cannot decode packet {}: {}",
                        format_hexadecimal(message.value(), true),
                        e
                    ),
                });
                Ok(PushStatus::Failure)
            }
        }
    }
}

/// An adapter decoding LoRaWAN uplink frames between two series.
pub type LoRaDecoderFilter = AdapterFilter<LoRaDecoderPusher>;

/// Builds a LoRa decoder; the keys are given in their 32-character
/// hexadecimal form.
pub fn lora_decoder_filter(
    name: impl Into<String>,
    manager: &TimeSeriesManager,
    input: impl Into<String>,
    output: impl Into<String>,
    nwk_skey: &str,
    app_skey: &str,
) -> Result<LoRaDecoderFilter, EngineError> {
    let name = name.into();
    let pusher = LoRaDecoderPusher {
        filter_name: name.clone(),
        writer: TimeSeriesWriter::new(manager, &output.into())?,
        nwk_skey: SessionKey::parse_hexadecimal(nwk_skey)?,
        app_skey: SessionKey::parse_hexadecimal(app_skey)?,
        events: manager.events(),
    };
    AdapterFilter::new(name, manager, input, pusher)
}

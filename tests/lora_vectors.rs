//! LoRaWAN codec vectors (lora-packet demo frames, RFC 4493) and the
//! decoder filter end-to-end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rill::backend::{MemoryBackend, TimeSeriesBackend};
use rill::filter::lora::lora_decoder_filter;
use rill::filter::FilterServer;
use rill::lora::{format_hexadecimal, parse_hexadecimal, MacPayload, PhyPayload, SessionKey};
use rill::manager::TimeSeriesFactory;
use rill::types::{Message, TimestampKind};
use rill::{EngineError, TimeSeriesManager, TimeSeriesReader, TimeSeriesWriter};

const FRAME: &str = "40F17DBE4900020001954378762B11FF0D";
const NWK_SKEY: &str = "44024241ed4ce9a68c6a8bc055233fd3";
const APP_SKEY: &str = "ec925802ae430ca77fd3dd73cb2cc588";

#[test]
fn decrypt_vector_yields_plaintext() {
    let phy = PhyPayload::parse_hexadecimal(FRAME).unwrap();
    let mac = MacPayload::from_phy(&phy).unwrap();

    assert_eq!(mac.device_address(), 0x49BE7DF1);
    assert_eq!(mac.frame_counter(), 2);
    assert_eq!(format_hexadecimal(mac.frame_payload(), true), "95437876");

    // FPort is 1, so the application session key applies.
    let app_skey = SessionKey::parse_hexadecimal(APP_SKEY).unwrap();
    let plaintext = app_skey.apply_frame(&phy, 0).unwrap();
    assert_eq!(plaintext, b"test");

    // Same result through the low-level keystream entry point.
    let direct = app_skey.apply(
        mac.frame_payload(),
        phy.direction().unwrap(),
        mac.device_address(),
        mac.frame_counter() as u32,
    );
    assert_eq!(direct, b"test");
}

#[test]
fn mic_vector_verifies() {
    let phy = PhyPayload::parse_hexadecimal(FRAME).unwrap();
    let nwk_skey = SessionKey::parse_hexadecimal(NWK_SKEY).unwrap();

    assert_eq!(phy.mic(), 0x0DFF112B);
    assert_eq!(nwk_skey.compute_mic(&phy, 0).unwrap(), 0x0DFF112B);
    assert!(nwk_skey.check_mic(&phy, 0));

    // The wrong key must not verify.
    let app_skey = SessionKey::parse_hexadecimal(APP_SKEY).unwrap();
    assert!(!app_skey.check_mic(&phy, 0));

    // A corrupted payload must not verify.
    let mut corrupted = parse_hexadecimal(FRAME).unwrap();
    corrupted[9] ^= 0x01;
    let corrupted = PhyPayload::from_buffer(corrupted).unwrap();
    assert!(!nwk_skey.check_mic(&corrupted, 0));
}

#[test]
fn second_demo_frame_verifies() {
    let phy = PhyPayload::parse_hexadecimal("40C51C012600010001FC98BDB0D4C6").unwrap();
    let mac = MacPayload::from_phy(&phy).unwrap();
    assert_eq!(mac.device_address(), 0x26011CC5);
    assert_eq!(mac.frame_counter(), 1);

    let app = SessionKey::parse_hexadecimal("b4661c6bf2dd3920e3a256f760aacc69").unwrap();
    let plaintext = app.apply_frame(&phy, 0).unwrap();
    assert_eq!(format_hexadecimal(&plaintext, true), "F700");

    // The app key is not the MIC key.
    assert!(!app.check_mic(&phy, 0));
}

/// P7: decrypt(encrypt(x)) is the identity with equal parameters.
#[test]
fn payload_crypto_roundtrip() {
    let key = SessionKey::parse_hexadecimal(APP_SKEY).unwrap();

    for length in [0usize, 1, 15, 16, 17, 32, 100] {
        let plaintext: Vec<u8> = (0..length as u8).collect();
        let encrypted = key.apply(
            &plaintext,
            rill::lora::MessageDirection::Uplink,
            0x49BE7DF1,
            0x00010002,
        );
        let decrypted = key.apply(
            &encrypted,
            rill::lora::MessageDirection::Uplink,
            0x49BE7DF1,
            0x00010002,
        );
        assert_eq!(decrypted, plaintext);
    }
}

/// P8: RFC 4493 test vectors.
#[test]
fn rfc4493_cmac_vectors() {
    let key = SessionKey::parse_hexadecimal("2b7e151628aed2a6abf7158809cf4f3c").unwrap();

    assert_eq!(
        format_hexadecimal(&key.cmac(b""), true),
        "BB1D6929E95937287FA37D129B756746"
    );

    let sixteen = parse_hexadecimal("6bc1bee22e409f96e93d7e117393172a").unwrap();
    assert_eq!(
        format_hexadecimal(&key.cmac(&sixteen), true),
        "070A16B46B4D4144F79BDD9DD04A287C"
    );

    let forty = parse_hexadecimal(
        "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e5130c81c46a35ce411",
    )
    .unwrap();
    assert_eq!(
        format_hexadecimal(&key.cmac(&forty), true),
        "DFA66747DE9AE63030CA32611497C827"
    );
}

#[test]
fn malformed_keys_are_rejected() {
    assert!(SessionKey::parse_hexadecimal("not hex").is_err());
    assert!(SessionKey::parse_hexadecimal("abcd").is_err());
    assert!(SessionKey::parse_hexadecimal(&"00".repeat(17)).is_err());
}

// ---------- Decoder filter end-to-end ----------

struct AutoFactory;

impl TimeSeriesFactory for AutoFactory {
    fn manual_series(&self) -> Vec<(String, TimestampKind)> {
        Vec::new()
    }

    fn create_manual(&self, _name: &str) -> Result<Box<dyn TimeSeriesBackend>, EngineError> {
        Ok(Box::new(MemoryBackend::new(0, 0)))
    }

    fn create_auto(
        &self,
        _name: &str,
    ) -> Result<Option<(Box<dyn TimeSeriesBackend>, TimestampKind)>, EngineError> {
        Ok(Some((
            Box::new(MemoryBackend::new(0, 0)),
            TimestampKind::Sequence,
        )))
    }
}

#[test]
fn decoder_filter_decodes_valid_frames_only() {
    let manager = Arc::new(TimeSeriesManager::new(Box::new(AutoFactory)).unwrap());

    let uplinks = TimeSeriesWriter::new(&manager, "uplinks").unwrap();

    // One valid frame, one with a corrupted MIC, one undecodable blob.
    let mut valid = Message::default();
    valid.set_value(parse_hexadecimal(FRAME).unwrap());
    assert!(uplinks.append(&valid));

    let mut bad_mic = Message::default();
    let mut corrupted = parse_hexadecimal(FRAME).unwrap();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xff;
    bad_mic.set_value(corrupted);
    assert!(uplinks.append(&bad_mic));

    let mut garbage = Message::default();
    garbage.set_value(vec![0x01, 0x02]);
    assert!(uplinks.append(&garbage));

    let mut decoder =
        lora_decoder_filter("decoder", &manager, "uplinks", "decoded", NWK_SKEY, APP_SKEY)
            .unwrap();
    decoder.set_replay_history(true);

    let mut server = FilterServer::new();
    server.add_filter(Box::new(decoder)).unwrap();
    server.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let reader = TimeSeriesReader::new(&manager, "decoded", false).unwrap();
        if reader.transaction().statistics().length >= 1 {
            break;
        }
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }

    // Give the filter time to walk past the two bad frames.
    std::thread::sleep(Duration::from_millis(100));
    assert!(server.stop());

    let reader = TimeSeriesReader::new(&manager, "decoded", false).unwrap();
    let mut transaction = reader.transaction();
    assert_eq!(transaction.statistics().length, 1);

    assert!(transaction.seek_first());
    // The decoded item inherits the uplink's timestamp and carries the
    // device address as metadata.
    assert_eq!(transaction.timestamp(), Some(0));
    let (metadata, value) = transaction.read().unwrap();
    assert_eq!(metadata, "49BE7DF1");
    assert_eq!(value, b"test");
}

//! LoRaWAN session keys: AES-CMAC (RFC 4493) for the MIC and the AES-CTR
//! keystream shared by payload encryption and decryption.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::EngineError;
use crate::lora::{parse_hexadecimal, MacPayload, MessageDirection, PhyPayload};

const BLOCK_SIZE: usize = 16;

/// A 128-bit LoRaWAN session key (NwkSKey or AppSKey).
#[derive(Clone)]
pub struct SessionKey {
    cipher: Aes128,
}

impl SessionKey {
    pub fn new(key: [u8; BLOCK_SIZE]) -> Self {
        SessionKey {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
        }
    }

    /// Parses a key from its 32-character hexadecimal form.
    pub fn parse_hexadecimal(key: &str) -> Result<Self, EngineError> {
        let bytes = parse_hexadecimal(key)?;
        let bytes: [u8; BLOCK_SIZE] = bytes
            .try_into()
            .map_err(|_| EngineError::BadInput("a session key must be 128 bits".to_string()))?;
        Ok(Self::new(bytes))
    }

    fn encrypt_block(&self, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = GenericArray::from(block);
        self.cipher.encrypt_block(&mut block);
        block.into()
    }

    /// AES-CMAC per RFC 4493.
    pub fn cmac(&self, message: &[u8]) -> [u8; BLOCK_SIZE] {
        let (k1, k2) = self.cmac_subkeys();

        let complete_blocks;
        let mut last = [0u8; BLOCK_SIZE];

        if !message.is_empty() && message.len() % BLOCK_SIZE == 0 {
            complete_blocks = message.len() / BLOCK_SIZE - 1;
            last.copy_from_slice(&message[complete_blocks * BLOCK_SIZE..]);
            xor_in_place(&mut last, &k1);
        } else {
            complete_blocks = message.len() / BLOCK_SIZE;
            let tail = &message[complete_blocks * BLOCK_SIZE..];
            last[..tail.len()].copy_from_slice(tail);
            last[tail.len()] = 0x80;
            xor_in_place(&mut last, &k2);
        }

        let mut x = [0u8; BLOCK_SIZE];
        for block in message[..complete_blocks * BLOCK_SIZE].chunks_exact(BLOCK_SIZE) {
            for (x, b) in x.iter_mut().zip(block) {
                *x ^= b;
            }
            x = self.encrypt_block(x);
        }

        xor_in_place(&mut x, &last);
        self.encrypt_block(x)
    }

    /// Subkeys K1/K2 of RFC 4493 §2.3.
    pub fn cmac_subkeys(&self) -> ([u8; BLOCK_SIZE], [u8; BLOCK_SIZE]) {
        let l = self.encrypt_block([0u8; BLOCK_SIZE]);
        let k1 = shift_left_with_rb(&l);
        let k2 = shift_left_with_rb(&k1);
        (k1, k2)
    }

    /// Block A_i / B0 of the LoRaWAN crypto scheme:
    /// `header | 00 00 00 00 | dir | DevAddr(LE) | FCnt32(LE) | 00 | trailer`.
    fn main_block(
        direction: MessageDirection,
        device_address: u32,
        frame_counter: u32,
        header: u8,
        trailer: u8,
    ) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = header;
        block[5] = direction.as_byte();
        block[6..10].copy_from_slice(&device_address.to_le_bytes());
        block[10..14].copy_from_slice(&frame_counter.to_le_bytes());
        block[15] = trailer;
        block
    }

    /// XORs `source` with the AES-CTR keystream for the given frame
    /// coordinates. Encryption and decryption are the same operation.
    pub fn apply(
        &self,
        source: &[u8],
        direction: MessageDirection,
        device_address: u32,
        frame_counter: u32,
    ) -> Vec<u8> {
        let mut target = Vec::with_capacity(source.len());
        let mut block = Self::main_block(direction, device_address, frame_counter, 0x01, 0);

        for (i, chunk) in source.chunks(BLOCK_SIZE).enumerate() {
            block[15] = (i + 1) as u8;
            let keystream = self.encrypt_block(block);
            target.extend(chunk.iter().zip(keystream.iter()).map(|(s, k)| s ^ k));
        }

        target
    }

    /// Decrypts (or encrypts) the FRMPayload of a data frame.
    /// `high_frame_counter` supplies the upper 16 bits of the 32-bit counter.
    pub fn apply_frame(
        &self,
        phy: &PhyPayload,
        high_frame_counter: u16,
    ) -> Result<Vec<u8>, EngineError> {
        let mac = MacPayload::from_phy(phy)?;
        let frame_counter =
            mac.frame_counter() as u32 | ((high_frame_counter as u32) << 16);

        Ok(self.apply(
            mac.frame_payload(),
            phy.direction()?,
            mac.device_address(),
            frame_counter,
        ))
    }

    /// Computes the 4-byte MIC of a data frame (little-endian u32).
    ///
    /// The authenticated message is `B0 | MHDR | FHDR | FPort | FRMPayload`,
    /// the FPort byte being present even when the frame carries none.
    pub fn compute_mic(
        &self,
        phy: &PhyPayload,
        high_frame_counter: u16,
    ) -> Result<u32, EngineError> {
        let mac = MacPayload::from_phy(phy)?;
        let frame_counter =
            mac.frame_counter() as u32 | ((high_frame_counter as u32) << 16);

        let message_length = 1 + mac.fhdr().len() + 1 + mac.frame_size();
        if message_length > 255 {
            return Err(EngineError::Protocol(format!(
                "too long message for MIC computation: {} bytes",
                message_length
            )));
        }

        let b0 = Self::main_block(
            phy.direction()?,
            mac.device_address(),
            frame_counter,
            0x49,
            message_length as u8,
        );

        let mut message = Vec::with_capacity(BLOCK_SIZE + message_length);
        message.extend_from_slice(&b0);
        message.push(phy.mhdr());
        message.extend_from_slice(mac.fhdr());
        message.push(mac.fport());
        message.extend_from_slice(mac.frame_payload());

        let cmac = self.cmac(&message);
        Ok(u32::from_le_bytes([cmac[0], cmac[1], cmac[2], cmac[3]]))
    }

    pub fn check_mic(&self, phy: &PhyPayload, high_frame_counter: u16) -> bool {
        match self.compute_mic(phy, high_frame_counter) {
            Ok(mic) => mic == phy.mic(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak key material through Debug.
        f.write_str("SessionKey(..)")
    }
}

fn xor_in_place(target: &mut [u8; BLOCK_SIZE], other: &[u8; BLOCK_SIZE]) {
    for (t, o) in target.iter_mut().zip(other) {
        *t ^= o;
    }
}

/// One left shift of a 128-bit value, XORing in Rb (0x87) when the dropped
/// most-significant bit was set (RFC 4493 subkey derivation).
fn shift_left_with_rb(value: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut result = [0u8; BLOCK_SIZE];
    let mut carry = 0;

    for i in (0..BLOCK_SIZE).rev() {
        result[i] = (value[i] << 1) | carry;
        carry = value[i] >> 7;
    }

    if carry != 0 {
        result[BLOCK_SIZE - 1] ^= 0x87;
    }

    result
}

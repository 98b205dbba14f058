//! SAS frame construction and parsing.
//!
//! A frame on the wire is `address || command || payload || crc`, with a
//! leading length byte inside the payload for variable-length commands. The
//! CRC is CRC-16/KERMIT (poly 0x1021, init 0x0000, reflected in/out, xorout
//! 0x0000) transmitted low byte first, computed over everything before it.
//! The wakeup marker on the first transmitted byte is a transport concern and
//! never enters the CRC.
//!
//! The codec is stateless: encoding returns the complete byte sequence
//! (without the wakeup marker) and decoding reads exactly one response of the
//! given shape from a reader.

use std::io::{self, Read};

use crc::{Crc, CRC_16_KERMIT};

use crate::error::{Error, Result};

/// CRC algorithm shared by every SAS frame.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// Upper bound on a payload; the length byte of variable frames caps at 255.
pub const MAX_PAYLOAD: usize = 255;

/// Computes the CRC-16/KERMIT of `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Shape of the response a command elicits, driving how many bytes the
/// decoder reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseShape {
    /// `address || command || payload(n) || crc`.
    Fixed(usize),
    /// `address || command || len || payload(len) || crc`.
    LengthPrefixed,
    /// Single ACK/NACK byte, no CRC.
    AckNack,
    /// Single exception byte answering a general poll, no CRC.
    ExceptionByte,
}

/// An outgoing long-poll frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub command: u8,
    pub payload: Vec<u8>,
    /// Insert a length byte before the payload (variable-length commands).
    pub length_prefixed: bool,
}

impl Frame {
    pub fn new(address: u8, command: u8) -> Self {
        Self {
            address,
            command,
            payload: Vec::new(),
            length_prefixed: false,
        }
    }

    pub fn with_payload(address: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            address,
            command,
            payload,
            length_prefixed: false,
        }
    }

    pub fn with_length_prefixed_payload(address: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            address,
            command,
            payload,
            length_prefixed: true,
        }
    }

    /// Assembles the complete frame bytes, CRC included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(Error::FrameTooLong(self.payload.len()));
        }

        let mut out = Vec::with_capacity(self.payload.len() + 5);
        out.push(self.address);
        out.push(self.command);

        if self.length_prefixed {
            out.push(self.payload.len() as u8);
        }

        out.extend_from_slice(&self.payload);

        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_le_bytes());

        Ok(out)
    }
}

/// A decoded response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub address: u8,
    pub command: u8,
    pub payload: Vec<u8>,
    /// Bytes consumed from the reader.
    pub consumed: usize,
}

/// Reads exactly one response of `shape` from `reader` and verifies its CRC.
///
/// Timeouts mid-frame surface as [`Error::ShortRead`] carrying how many bytes
/// actually arrived.
pub fn decode<R: Read>(reader: &mut R, shape: ResponseShape) -> Result<Decoded> {
    match shape {
        ResponseShape::AckNack | ResponseShape::ExceptionByte => {
            let byte = read_exact(reader, 1, 0)?;
            Ok(Decoded {
                address: byte[0],
                command: 0,
                payload: byte,
                consumed: 1,
            })
        }
        ResponseShape::Fixed(n) => {
            if n > MAX_PAYLOAD {
                return Err(Error::FrameTooLong(n));
            }
            let head = read_exact(reader, 2, 0)?;
            let rest = read_exact(reader, n + 2, 2)?;
            finish(head, rest, n)
        }
        ResponseShape::LengthPrefixed => {
            let head = read_exact(reader, 3, 0)?;
            let len = head[2] as usize;
            let rest = read_exact(reader, len + 2, 3)?;
            finish(head, rest, len)
        }
    }
}

// Splits `rest` into payload and CRC, verifies, and assembles the result.
fn finish(head: Vec<u8>, rest: Vec<u8>, payload_len: usize) -> Result<Decoded> {
    let consumed = head.len() + rest.len();
    let (payload, crc_bytes) = rest.split_at(payload_len);

    let mut covered = head;
    covered.extend_from_slice(payload);

    let expected = crc16(&covered);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);

    if expected != actual {
        return Err(Error::BadCrc { expected, actual });
    }

    Ok(Decoded {
        address: covered[0],
        command: covered[1],
        payload: payload.to_vec(),
        consumed,
    })
}

// read_exact that reports how many bytes arrived before a timeout.
// `already` offsets the ShortRead accounting for earlier reads of the frame.
fn read_exact<R: Read>(reader: &mut R, wanted: usize, already: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; wanted];
    let mut got = 0;

    while got < wanted {
        match reader.read(&mut buf[got..]) {
            Ok(0) => {
                return Err(Error::ShortRead {
                    wanted: already + wanted,
                    got: already + got,
                })
            }
            Ok(n) => got += n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                return Err(Error::ShortRead {
                    wanted: already + wanted,
                    got: already + got,
                })
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::Io(err)),
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_gaming_machine_id_poll() {
        // CRC-16/KERMIT over 01 1F is 0xF1AE, low byte first on the wire.
        let frame = Frame::new(0x01, 0x1f);
        assert_eq!(frame.encode().unwrap(), vec![0x01, 0x1f, 0xae, 0xf1]);
    }

    #[test]
    fn crc_check_value() {
        // Published check value for CRC-16/KERMIT.
        assert_eq!(crc16(b"123456789"), 0x2189);
    }

    #[test]
    fn round_trip_fixed() {
        let frame = Frame::with_payload(0x01, 0x51, vec![0xde, 0xad, 0xbe, 0xef]);
        let bytes = frame.encode().unwrap();

        let mut reader = bytes.as_slice();
        let decoded = decode(&mut reader, ResponseShape::Fixed(4)).unwrap();

        assert_eq!(decoded.address, 0x01);
        assert_eq!(decoded.command, 0x51);
        assert_eq!(decoded.payload, frame.payload);
        assert_eq!(decoded.consumed, bytes.len());
    }

    #[test]
    fn round_trip_length_prefixed() {
        let frame = Frame::with_length_prefixed_payload(0x02, 0x72, vec![0x00, 0x01, 0x02]);
        let bytes = frame.encode().unwrap();

        let mut reader = bytes.as_slice();
        let decoded = decode(&mut reader, ResponseShape::LengthPrefixed).unwrap();

        assert_eq!(decoded.payload, frame.payload);
        assert_eq!(decoded.consumed, bytes.len());
    }

    #[test]
    fn single_bit_flip_fails_crc() {
        let frame = Frame::with_payload(0x01, 0x2f, vec![0x11, 0x22, 0x33]);
        let reference = frame.encode().unwrap();

        for byte_idx in 0..reference.len() {
            for bit in 0..8 {
                let mut corrupted = reference.clone();
                corrupted[byte_idx] ^= 1 << bit;

                let mut reader = corrupted.as_slice();
                let result = decode(&mut reader, ResponseShape::Fixed(3));
                assert!(
                    matches!(result, Err(Error::BadCrc { .. })),
                    "flip of byte {byte_idx} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn truncated_frame_is_short_read() {
        let frame = Frame::with_payload(0x01, 0x2f, vec![0x11, 0x22, 0x33]);
        let bytes = frame.encode().unwrap();

        let mut reader = &bytes[..4];
        match decode(&mut reader, ResponseShape::Fixed(3)) {
            Err(Error::ShortRead { wanted, got }) => {
                assert_eq!(wanted, bytes.len());
                assert_eq!(got, 4);
            }
            other => panic!("expected ShortRead, got {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let frame = Frame::with_payload(0x01, 0x72, vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(frame.encode(), Err(Error::FrameTooLong(_))));
    }
}

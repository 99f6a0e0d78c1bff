use tokio_util::bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::registers::RegisterKind;

/// Exception code reported by gateways and units that are still processing an earlier request.
pub const SERVER_BUSY: u8 = 6;

const MBAP_HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ReadHoldings { address: u16, count: u16 },
    ReadInputs { address: u16, count: u16 },
    WriteHolding { address: u16, value: u16 },
}

impl Operation {
    pub fn read(kind: RegisterKind, address: u16, count: u16) -> Self {
        match kind {
            RegisterKind::Holding => Self::ReadHoldings { address, count },
            RegisterKind::Input => Self::ReadInputs { address, count },
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            Operation::ReadHoldings { .. } => 3,
            Operation::ReadInputs { .. } => 4,
            Operation::WriteHolding { .. } => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::Exception(c) => Some(*c),
            ResponseKind::Registers(_) | ResponseKind::Written { .. } => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(SERVER_BUSY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Exception(u8),
    Registers(Vec<u16>),
    Written { address: u16, value: u16 },
}

/// Modbus TCP (MBAP) framing.
#[derive(Default)]
pub struct ModbusTcpCodec {}

impl Encoder<Request> for ModbusTcpCodec {
    type Error = std::io::Error;
    fn encode(
        &mut self,
        req: Request,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        let (first, second) = match req.operation {
            Operation::ReadHoldings { address, count } => (address, count),
            Operation::ReadInputs { address, count } => (address, count),
            Operation::WriteHolding { address, value } => (address, value),
        };
        dst.reserve(MBAP_HEADER_LEN + 6);
        dst.put_u16(req.transaction_id);
        dst.put_u16(0);
        // unit id, function code and two 16-bit fields
        dst.put_u16(6);
        dst.put_u8(req.device_id);
        dst.put_u8(req.operation.function_code());
        dst.put_u16(first);
        dst.put_u16(second);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTcpCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, remainder)) = src.split_first_chunk::<MBAP_HEADER_LEN>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let proto = u16::from_be_bytes([header[2], header[3]]);
            if proto != 0 {
                src.advance(1);
                continue;
            }
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            let Some((data, _)) = remainder.split_at_checked(length) else {
                return Ok(None);
            };
            let &[device_id, function_code, ref body @ ..] = data else {
                src.advance(1);
                continue;
            };
            let kind = if function_code & 0x80 != 0 {
                let &[code, ..] = body else {
                    src.advance(1);
                    continue;
                };
                ResponseKind::Exception(code)
            } else {
                match (function_code, body) {
                    (3 | 4, [byte_count, values @ ..])
                        if byte_count % 2 == 1 || values.len() % 2 == 1 =>
                    {
                        trace!(byte_count, actual = values.len(), "skipping a frame with a split register");
                        src.advance(MBAP_HEADER_LEN + length);
                        continue;
                    }
                    (3 | 4, [byte_count, values @ ..]) => {
                        // The byte count is not trustworthy for large reads through some
                        // gateways. The MBAP length is authoritative.
                        trace!(byte_count, actual = values.len(), "register payload");
                        let words = values
                            .chunks_exact(2)
                            .map(|w| u16::from_be_bytes([w[0], w[1]]))
                            .collect();
                        ResponseKind::Registers(words)
                    }
                    (6, &[a0, a1, v0, v1]) => ResponseKind::Written {
                        address: u16::from_be_bytes([a0, a1]),
                        value: u16::from_be_bytes([v0, v1]),
                    },
                    _ => {
                        trace!(function_code, "skipping an unexpected frame");
                        src.advance(MBAP_HEADER_LEN + length);
                        continue;
                    }
                }
            };
            src.advance(MBAP_HEADER_LEN + length);
            return Ok(Some(Response { device_id, transaction_id, kind }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;

    fn encode(operation: Operation) -> Vec<u8> {
        let mut buffer = BytesMut::new();
        let request = Request { device_id: 1, transaction_id: 0x0102, operation };
        ModbusTcpCodec::default().encode(request, &mut buffer).unwrap();
        buffer.to_vec()
    }

    #[test]
    fn encodes_reads_and_writes() {
        assert_eq!(
            encode(Operation::ReadHoldings { address: 1130, count: 1 }),
            [1, 2, 0, 0, 0, 6, 1, 3, 0x04, 0x6A, 0, 1]
        );
        assert_eq!(
            encode(Operation::ReadInputs { address: 12102, count: 2 }),
            [1, 2, 0, 0, 0, 6, 1, 4, 0x2F, 0x46, 0, 2]
        );
        assert_eq!(
            encode(Operation::WriteHolding { address: 2000, value: 215 }),
            [1, 2, 0, 0, 0, 6, 1, 6, 0x07, 0xD0, 0, 215]
        );
    }

    #[test]
    fn decodes_register_response() {
        let mut buffer = BytesMut::from(&[0, 7, 0, 0, 0, 7, 1, 4, 4, 0, 215, 0xFF, 0xCE][..]);
        let response = ModbusTcpCodec::default().decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.transaction_id, 7);
        assert_eq!(response.kind, ResponseKind::Registers(vec![215, 0xFFCE]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn decodes_write_echo_and_exceptions() {
        let mut buffer = BytesMut::from(
            &[
                0, 1, 0, 0, 0, 6, 1, 6, 0x07, 0xD0, 0, 215, // write echo
                0, 2, 0, 0, 0, 3, 1, 0x83, 6, // server busy
            ][..],
        );
        let mut codec = ModbusTcpCodec::default();
        let written = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(written.kind, ResponseKind::Written { address: 2000, value: 215 });
        let busy = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(busy.is_server_busy());
        assert_eq!(busy.transaction_id, 2);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn waits_for_complete_frames() {
        let mut codec = ModbusTcpCodec::default();
        let mut buffer = BytesMut::from(&[0, 7, 0, 0, 0, 5, 1, 3, 2][..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&[0]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&[42]);
        let response = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.kind, ResponseKind::Registers(vec![42]));
    }

    #[test]
    fn resynchronises_after_garbage() {
        let mut buffer = BytesMut::from(&[0xAA, 0, 9, 0, 0, 0, 5, 1, 3, 2, 0, 1][..]);
        let response = ModbusTcpCodec::default().decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.transaction_id, 9);
        assert_eq!(response.kind, ResponseKind::Registers(vec![1]));
    }

    #[test]
    fn skips_frames_with_a_split_register() {
        let mut buffer = BytesMut::from(
            &[
                0, 3, 0, 0, 0, 6, 1, 3, 3, 0, 1, 2, // odd byte count and payload
                0, 4, 0, 0, 0, 6, 1, 3, 2, 0, 1, 2, // even byte count, odd payload
                0, 5, 0, 0, 0, 5, 1, 3, 2, 0, 7,
            ][..],
        );
        let response = ModbusTcpCodec::default().decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.transaction_id, 5);
        assert_eq!(response.kind, ResponseKind::Registers(vec![7]));
        assert!(buffer.is_empty());
    }
}

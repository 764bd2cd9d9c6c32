//! 패킷 코덱
//!
//! 하나의 데이터그램 = 헤더 + 블록 N개 + ACK K개.
//! 같은 피어로 가는 블록은 크기 한도(봉인 후 MAX_PACKET_SIZE) 안에서 최대한 합친다.
//!
//! ```text
//! magic(4) | version(1) | type(1) | sender(4) | blocks(1) | acks(1)
//! [seq(4) | len(2) | payload(len)] * blocks
//! [seq(4)] * acks
//! ```
//!
//! 모든 정수는 고정 폭 big-endian. 헤더는 평문으로 남고(AAD) 나머지는 암호화된다.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::SEAL_OVERHEAD;
use crate::peer::PeerId;
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 평문 헤더 크기
pub const HEADER_SIZE: usize = 12;

/// 블록 레코드 헤더 크기 (seq + len)
pub const BLOCK_HEADER_SIZE: usize = 6;

/// ACK 항목 크기
pub const ACK_SIZE: usize = 4;

/// 패킷당 최대 블록/ACK 수 (카운트 필드가 u8)
pub const MAX_ENTRIES_PER_PACKET: usize = u8::MAX as usize;

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// 블록을 실은 패킷 (ACK 동봉 가능)
    Data = 1,

    /// ACK 전용 패킷
    Ack = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Data),
            2 => Ok(PacketType::Ack),
            other => Err(Error::malformed(format!("알 수 없는 패킷 타입 {}", other))),
        }
    }
}

/// 패킷 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,

    /// 송신 노드
    pub sender: PeerId,

    pub block_count: u8,

    pub ack_count: u8,
}

impl PacketHeader {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(MAGIC_NUMBER);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.packet_type as u8);
        buf.put_u32(self.sender.0);
        buf.put_u8(self.block_count);
        buf.put_u8(self.ack_count);
    }

    fn parse(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::malformed(format!(
                "헤더 부족: {} bytes",
                bytes.len()
            )));
        }

        let magic = bytes.get_u32();
        if magic != MAGIC_NUMBER {
            return Err(Error::malformed(format!("매직 넘버 불일치: {:08X}", magic)));
        }

        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::malformed(format!("지원하지 않는 버전 {}", version)));
        }

        let packet_type = PacketType::try_from(bytes.get_u8())?;
        let sender = PeerId(bytes.get_u32());
        let block_count = bytes.get_u8();
        let ack_count = bytes.get_u8();

        match packet_type {
            PacketType::Data if block_count == 0 => {
                return Err(Error::malformed("블록 없는 DATA 패킷"));
            }
            PacketType::Ack if block_count != 0 || ack_count == 0 => {
                return Err(Error::malformed("ACK 패킷 카운트 불일치"));
            }
            _ => {}
        }

        Ok(Self {
            packet_type,
            sender,
            block_count,
            ack_count,
        })
    }
}

/// 프레임 단위 애플리케이션 블록
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub seq: u32,
    pub payload: Bytes,
}

impl Block {
    pub fn new(seq: u32, payload: Bytes) -> Self {
        Self { seq, payload }
    }

    fn encoded_len(&self) -> usize {
        BLOCK_HEADER_SIZE + self.payload.len()
    }
}

/// 인코딩 결과
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// 봉인 전 평문 패킷
    pub bytes: Bytes,

    /// 앞에서부터 실린 블록 수 (나머지는 다음 패킷으로)
    pub blocks_taken: usize,

    /// 앞에서부터 실린 ACK 수
    pub acks_taken: usize,
}

/// 디코딩 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    pub blocks: Vec<Block>,
    pub acks: Vec<u32>,
}

/// 패킷 코덱
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// 봉인 후 패킷 최대 크기
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// 봉인 전 평문 패킷 최대 크기
    pub fn plain_limit(&self) -> usize {
        self.max_packet_size.saturating_sub(SEAL_OVERHEAD)
    }

    /// 단독 패킷에 실을 수 있는 최대 페이로드
    pub fn max_block_payload(&self) -> usize {
        self.plain_limit()
            .saturating_sub(HEADER_SIZE + BLOCK_HEADER_SIZE)
            .min(u16::MAX as usize)
    }

    /// 블록과 ACK를 한 패킷으로 인코딩
    ///
    /// 블록은 주어진 순서대로, 다음 블록이 한도를 넘기기 직전까지 싣는다.
    /// 남은 공간은 ACK로 채운다. 실리지 못한 항목은 호출자가 다음 패킷에 넣는다.
    pub fn encode(&self, sender: PeerId, blocks: &[Block], acks: &[u32]) -> Result<EncodedPacket> {
        let limit = self.plain_limit();

        if let Some(first) = blocks.first() {
            if first.payload.len() > self.max_block_payload() {
                return Err(Error::PayloadTooLarge {
                    size: first.payload.len(),
                    max: self.max_block_payload(),
                });
            }
        }

        let mut size = HEADER_SIZE;
        let mut blocks_taken = 0;
        for block in blocks.iter().take(MAX_ENTRIES_PER_PACKET) {
            if size + block.encoded_len() > limit {
                break;
            }
            size += block.encoded_len();
            blocks_taken += 1;
        }

        let ack_room = limit.saturating_sub(size) / ACK_SIZE;
        let acks_taken = acks.len().min(ack_room).min(MAX_ENTRIES_PER_PACKET);

        if blocks_taken == 0 && acks_taken == 0 {
            return Err(Error::EmptyPacket);
        }

        let header = PacketHeader {
            packet_type: if blocks_taken > 0 {
                PacketType::Data
            } else {
                PacketType::Ack
            },
            sender,
            block_count: blocks_taken as u8,
            ack_count: acks_taken as u8,
        };

        let mut buf = BytesMut::with_capacity(size + acks_taken * ACK_SIZE);
        header.write(&mut buf);
        for block in &blocks[..blocks_taken] {
            buf.put_u32(block.seq);
            buf.put_u16(block.payload.len() as u16);
            buf.put_slice(&block.payload);
        }
        for &seq in &acks[..acks_taken] {
            buf.put_u32(seq);
        }

        Ok(EncodedPacket {
            bytes: buf.freeze(),
            blocks_taken,
            acks_taken,
        })
    }

    /// 헤더만 파싱 (복호화 전 송신자 확인용)
    pub fn peek_header(&self, bytes: &[u8]) -> Result<PacketHeader> {
        PacketHeader::parse(bytes)
    }

    /// 평문 패킷 디코딩
    ///
    /// 길이 필드는 남은 버퍼와 먼저 비교한 뒤에만 슬라이스한다.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedPacket> {
        if bytes.len() > self.max_packet_size {
            return Err(Error::malformed(format!(
                "패킷 크기 초과: {} bytes",
                bytes.len()
            )));
        }

        let header = PacketHeader::parse(bytes)?;
        let mut body = &bytes[HEADER_SIZE..];

        let mut blocks = Vec::with_capacity(header.block_count as usize);
        for _ in 0..header.block_count {
            if body.remaining() < BLOCK_HEADER_SIZE {
                return Err(Error::malformed("블록 헤더 잘림"));
            }
            let seq = body.get_u32();
            let len = body.get_u16() as usize;
            if body.remaining() < len {
                return Err(Error::malformed(format!(
                    "블록 길이 {} > 남은 {} bytes",
                    len,
                    body.remaining()
                )));
            }
            blocks.push(Block::new(seq, Bytes::copy_from_slice(&body[..len])));
            body.advance(len);
        }

        let expected = header.ack_count as usize * ACK_SIZE;
        if body.remaining() != expected {
            return Err(Error::malformed(format!(
                "ACK 영역 불일치: expected {} bytes, got {}",
                expected,
                body.remaining()
            )));
        }

        let acks = (0..header.ack_count).map(|_| body.get_u32()).collect();

        Ok(DecodedPacket {
            header,
            blocks,
            acks,
        })
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(crate::MAX_PACKET_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_PACKET_SIZE;

    fn block(seq: u32, len: usize) -> Block {
        Block::new(seq, Bytes::from(vec![(seq % 251) as u8; len]))
    }

    #[test]
    fn test_packet_roundtrip() {
        let codec = PacketCodec::default();
        let blocks = vec![block(10, 5), block(11, 0), block(12, 40)];
        let acks = vec![7, 8, 0xFFFF_FFFF];

        let encoded = codec.encode(PeerId(42), &blocks, &acks).unwrap();
        assert_eq!(encoded.blocks_taken, 3);
        assert_eq!(encoded.acks_taken, 3);

        let decoded = codec.decode(&encoded.bytes).unwrap();
        assert_eq!(decoded.header.sender, PeerId(42));
        assert_eq!(decoded.header.packet_type, PacketType::Data);
        assert_eq!(decoded.blocks, blocks);
        assert_eq!(decoded.acks, acks);
    }

    #[test]
    fn test_coalescing_defers_overflow() {
        let codec = PacketCodec::default();
        // 평문 한도 484: 헤더 12 + 106 * 4 = 436, 다섯 번째는 넘침
        let blocks: Vec<Block> = (0..10).map(|seq| block(seq, 100)).collect();

        let encoded = codec.encode(PeerId(1), &blocks, &[]).unwrap();
        assert_eq!(encoded.blocks_taken, 4);
        assert!(encoded.bytes.len() + SEAL_OVERHEAD <= MAX_PACKET_SIZE);
    }

    #[test]
    fn test_never_exceeds_max_packet_size() {
        let codec = PacketCodec::default();
        let blocks: Vec<Block> = (0..40).map(|seq| block(seq, (seq as usize * 37) % 300)).collect();
        let acks: Vec<u32> = (1000..1300).collect();

        let mut rest_blocks = &blocks[..];
        let mut rest_acks = &acks[..];
        let mut delivered = Vec::new();
        let mut acked = Vec::new();

        while !rest_blocks.is_empty() || !rest_acks.is_empty() {
            let encoded = codec.encode(PeerId(1), rest_blocks, rest_acks).unwrap();
            assert!(encoded.bytes.len() + SEAL_OVERHEAD <= MAX_PACKET_SIZE);

            let decoded = codec.decode(&encoded.bytes).unwrap();
            delivered.extend(decoded.blocks);
            acked.extend(decoded.acks);

            rest_blocks = &rest_blocks[encoded.blocks_taken..];
            rest_acks = &rest_acks[encoded.acks_taken..];
        }

        // 순서 보존, 누락 없음
        assert_eq!(delivered, blocks);
        assert_eq!(acked, acks);
    }

    #[test]
    fn test_largest_block_fits_exactly() {
        let codec = PacketCodec::default();
        assert_eq!(codec.max_block_payload(), 466);

        let encoded = codec
            .encode(PeerId(1), &[block(1, codec.max_block_payload())], &[])
            .unwrap();
        assert_eq!(encoded.bytes.len() + SEAL_OVERHEAD, MAX_PACKET_SIZE);

        match codec.encode(PeerId(1), &[block(1, 467)], &[]) {
            Err(Error::PayloadTooLarge { size, max }) => {
                assert_eq!(size, 467);
                assert_eq!(max, 466);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_ack_only_packet() {
        let codec = PacketCodec::default();
        let acks: Vec<u32> = (0..200).collect();

        let encoded = codec.encode(PeerId(3), &[], &acks).unwrap();
        assert_eq!(encoded.blocks_taken, 0);
        assert_eq!(encoded.acks_taken, (484 - HEADER_SIZE) / ACK_SIZE);

        let decoded = codec.decode(&encoded.bytes).unwrap();
        assert_eq!(decoded.header.packet_type, PacketType::Ack);
        assert!(decoded.blocks.is_empty());
        assert_eq!(decoded.acks, acks[..encoded.acks_taken].to_vec());
    }

    #[test]
    fn test_empty_packet_rejected() {
        let codec = PacketCodec::default();
        assert!(matches!(
            codec.encode(PeerId(1), &[], &[]),
            Err(Error::EmptyPacket)
        ));
    }

    #[test]
    fn test_truncated_packets_rejected() {
        let codec = PacketCodec::default();
        let encoded = codec
            .encode(PeerId(1), &[block(1, 30), block(2, 30)], &[9])
            .unwrap();

        for cut in 0..encoded.bytes.len() {
            assert!(
                codec.decode(&encoded.bytes[..cut]).is_err(),
                "cut at {} decoded",
                cut
            );
        }
    }

    #[test]
    fn test_length_field_beyond_buffer() {
        let codec = PacketCodec::default();
        let encoded = codec.encode(PeerId(1), &[block(1, 4)], &[]).unwrap();

        let mut forged = encoded.bytes.to_vec();
        // 블록 len 필드를 0xFFFF로 위조
        forged[HEADER_SIZE + 4] = 0xFF;
        forged[HEADER_SIZE + 5] = 0xFF;

        assert!(matches!(
            codec.decode(&forged),
            Err(Error::MalformedPacket { .. })
        ));
    }

    #[test]
    fn test_bad_header_fields() {
        let codec = PacketCodec::default();
        let good = codec.encode(PeerId(1), &[block(1, 4)], &[]).unwrap().bytes.to_vec();

        let mut bad_magic = good.clone();
        bad_magic[0] ^= 0xFF;
        assert!(codec.peek_header(&bad_magic).is_err());

        let mut bad_version = good.clone();
        bad_version[4] = PROTOCOL_VERSION + 1;
        assert!(codec.peek_header(&bad_version).is_err());

        let mut bad_type = good.clone();
        bad_type[5] = 9;
        assert!(codec.peek_header(&bad_type).is_err());

        let mut trailing = good.clone();
        trailing.push(0);
        assert!(codec.decode(&trailing).is_err());

        let mut no_blocks = good;
        no_blocks[10] = 0;
        assert!(codec.decode(&no_blocks).is_err());
    }
}

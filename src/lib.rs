//! # NDT (Node Datagram Transport)
//!
//! 분산 노드 네트워크용 보안·신뢰 데이터그램 전송 계층
//!
//! ## 핵심 특징
//! - **피어 단위 주소 지정**: 노드 ID로 보내고, 어느 피어로부터든 받는다
//! - **블록 코얼레싱**: 여러 블록과 ACK를 512바이트 패킷 하나에 묶음
//! - **블록별 재전송**: 고정 간격, 최대 시도 횟수 제한
//! - **세션 암호화**: X25519 + HKDF-SHA256 키 합의, ChaCha20-Poly1305 패킷 봉인
//! - **수신 큐**: 컨슈머 등록 전 도착한 페이로드 보관 후 순서대로 전달
//! - **테스트 모드**: 시드 고정 패킷 손실 / 재정렬

pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod packet;
pub mod peer;
pub mod retransmit;
pub mod socket;
pub mod stats;
pub mod transport;

use std::time::Duration;

pub use config::Config;
pub use crypto::{CryptoError, CryptoSession, KeyPair, PacketCipher, SessionKey};
pub use dispatch::{Consumer, Dispatcher, InboundPayload};
pub use error::{Error, Result};
pub use fault::{FaultInjector, TestMode};
pub use packet::{Block, DecodedPacket, EncodedPacket, PacketCodec, PacketType};
pub use peer::{Directory, PeerId, PeerInfo, StaticDirectory};
pub use retransmit::{BlockState, DeliveryFailure, RetransmitEngine};
pub use socket::{DatagramSocket, MemoryNetwork, MemorySocket};
pub use stats::TransportStats;
pub use transport::{PeerTransport, Transport};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u32 = 0x4E44_5450; // "NDTP"

/// 최대 패킷 크기 (암호화 오버헤드 포함)
pub const MAX_PACKET_SIZE: usize = 512;

/// 블록당 최대 전송 시도 횟수
pub const RETRANSMIT_MAX_ATTEMPTS: u32 = 10;

/// 재전송 간격 (밀리초)
pub const RETRANSMIT_TIME_MS: u64 = 10_000;

/// 재전송 간격
pub const RETRANSMIT_TIME: Duration = Duration::from_millis(RETRANSMIT_TIME_MS);

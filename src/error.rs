//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::peer::PeerId;

/// NDT 전송 계층 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("잘못된 패킷: {reason}")]
    MalformedPacket { reason: String },

    #[error("재전송 한도 초과: peer={peer}, seq={seq}, attempts={attempts}")]
    RetransmissionExhausted { peer: PeerId, seq: u32, attempts: u32 },

    #[error("알 수 없는 피어: {peer}")]
    UnknownPeer { peer: PeerId },

    #[error("페이로드 크기 초과: {size} bytes (최대 {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("블록도 ACK도 없는 패킷은 만들 수 없음")]
    EmptyPacket,

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("전송 계층 종료됨")]
    Closed,

    #[error("종료 요청으로 전송 중단")]
    Interrupted,
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedPacket {
            reason: reason.into(),
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

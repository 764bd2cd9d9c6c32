//! 피어 식별자와 디렉터리
//!
//! 피어 ID → (네트워크 주소, 장기 공개키) 매핑은 외부 디렉터리 서비스가 담당한다.
//! 전송 계층은 [`Directory`] 트레이트로만 접근한다.

use std::fmt;
use std::net::SocketAddr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::crypto::PUBLIC_KEY_SIZE;
use crate::{Error, Result};

/// 피어 ID (노드 번호)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u32> for PeerId {
    fn from(id: u32) -> Self {
        PeerId(id)
    }
}

/// 디렉터리가 돌려주는 피어 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,

    /// 데이터그램 주소
    pub addr: SocketAddr,

    /// X25519 장기 공개키
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

impl PeerInfo {
    pub fn new(id: impl Into<PeerId>, addr: SocketAddr, public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self {
            id: id.into(),
            addr,
            public_key,
        }
    }
}

/// 피어 디렉터리 (외부 협력자)
pub trait Directory: Send + Sync {
    /// 피어 정보 조회. 없으면 [`Error::UnknownPeer`]
    fn resolve(&self, peer: PeerId) -> Result<PeerInfo>;
}

/// 메모리 기반 정적 디렉터리
#[derive(Debug, Default)]
pub struct StaticDirectory {
    peers: DashMap<PeerId, PeerInfo>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 피어 등록 (같은 ID면 덮어씀)
    pub fn insert(&self, info: PeerInfo) -> Option<PeerInfo> {
        self.peers.insert(info.id, info)
    }

    pub fn remove(&self, peer: PeerId) -> Option<PeerInfo> {
        self.peers.remove(&peer).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl FromIterator<PeerInfo> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = PeerInfo>>(iter: I) -> Self {
        let directory = Self::new();
        for info in iter {
            directory.insert(info);
        }
        directory
    }
}

impl Directory for StaticDirectory {
    fn resolve(&self, peer: PeerId) -> Result<PeerInfo> {
        self.peers
            .get(&peer)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnknownPeer { peer })
    }
}

//! 암호화 모듈 - X25519 장기 키 + ChaCha20-Poly1305 세션 암호화
//!
//! 흐름:
//! 1. 각 노드는 장기 X25519 키쌍을 가짐 (공개키는 디렉터리에 등록)
//! 2. 피어별 세션 키: 외부에서 설치하거나, DH 공유 비밀 → HKDF-SHA256으로 유도
//! 3. 패킷 헤더는 평문(AAD)으로 두고 본문(블록 + ACK)만 암호화
//!
//! 키 재료는 로그나 에러 메시지에 절대 포함하지 않는다.

use std::fmt;
use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use dashmap::DashMap;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::packet::HEADER_SIZE;
use crate::peer::{PeerId, PeerInfo};

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// 세션 키 크기 (32 bytes)
pub const SESSION_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 봉인된 패킷에 추가되는 바이트 수 (nonce + tag)
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

const KDF_INFO: &[u8] = b"ndt/v1 session key";

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("키 교환 실패")]
    KeyExchangeFailed,
    #[error("세션 키 유도 실패")]
    KeyDerivationFailed,
    #[error("세션 키 없음: {0}")]
    UnknownSession(PeerId),
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
}

/// 노드 장기 키쌍
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// 새 키쌍 생성
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 저장된 비밀키로 복원
    pub fn from_secret_bytes(mut bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 공개키 반환
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// 공개키를 바이트로 변환
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// 상대방 공개키로 공유 비밀 계산
    ///
    /// 저차(low-order) 공개키로 인해 결과가 0이 되면 실패
    pub fn compute_shared_secret(
        &self,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<[u8; 32], CryptoError> {
        let peer_public = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchangeFailed);
        }
        Ok(*shared.as_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// 대칭 세션 키
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// 외부에서 합의된 키로 생성
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// 무작위 키 생성
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// DH 공유 비밀에서 세션 키 유도
    ///
    /// salt는 두 공개키를 정렬해 이어 붙인 값이라 양쪽이 같은 키를 얻는다.
    pub fn derive(
        local: &KeyPair,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Self, CryptoError> {
        let mut shared = local.compute_shared_secret(peer_public)?;

        let local_public = local.public_key_bytes();
        let (low, high) = if local_public <= *peer_public {
            (local_public, *peer_public)
        } else {
            (*peer_public, local_public)
        };
        let mut salt = [0u8; PUBLIC_KEY_SIZE * 2];
        salt[..PUBLIC_KEY_SIZE].copy_from_slice(&low);
        salt[PUBLIC_KEY_SIZE..].copy_from_slice(&high);

        let hk = Hkdf::<Sha256>::new(Some(&salt), &shared);
        let mut okm = [0u8; SESSION_KEY_SIZE];
        let expanded = hk.expand(KDF_INFO, &mut okm);
        shared.zeroize();
        expanded.map_err(|_| CryptoError::KeyDerivationFailed)?;

        let key = Self(okm);
        okm.zeroize();
        Ok(key)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// 패킷 암호화기
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
}

impl PacketCipher {
    /// 세션 키로 암호화기 생성
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
        }
    }

    /// 암호화
    /// 반환: nonce(12) + ciphertext(원본 + 16바이트 태그)
    ///
    /// 양방향이 같은 키를 쓰므로 카운터 대신 무작위 nonce 사용
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// 복호화 + 인증
    /// 입력: nonce(12) + ciphertext
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// 피어별 암호화 세션 테이블
///
/// 로컬 비밀키는 이 구조체만 소유한다.
pub struct CryptoSession {
    keypair: KeyPair,
    sessions: DashMap<PeerId, Arc<PacketCipher>>,
}

impl CryptoSession {
    pub fn new(keypair: KeyPair) -> Self {
        Self {
            keypair,
            sessions: DashMap::new(),
        }
    }

    /// 자신의 공개키
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.keypair.public_key_bytes()
    }

    /// 외부에서 합의된 세션 키 설치 (기존 세션 교체)
    pub fn install_session_key(&self, peer: PeerId, key: &SessionKey) {
        self.sessions.insert(peer, Arc::new(PacketCipher::new(key)));
    }

    /// 세션이 없으면 디렉터리 공개키로 DH 세션 생성
    pub fn establish(&self, peer: &PeerInfo) -> Result<(), CryptoError> {
        if self.sessions.contains_key(&peer.id) {
            return Ok(());
        }

        let key = SessionKey::derive(&self.keypair, &peer.public_key)?;
        self.sessions
            .entry(peer.id)
            .or_insert_with(|| Arc::new(PacketCipher::new(&key)));
        Ok(())
    }

    pub fn has_session(&self, peer: PeerId) -> bool {
        self.sessions.contains_key(&peer)
    }

    /// 세션 폐기
    pub fn forget(&self, peer: PeerId) {
        self.sessions.remove(&peer);
    }

    fn cipher(&self, peer: PeerId) -> Result<Arc<PacketCipher>, CryptoError> {
        self.sessions
            .get(&peer)
            .map(|entry| entry.value().clone())
            .ok_or(CryptoError::UnknownSession(peer))
    }

    /// 피어용 암호화
    pub fn encrypt_for_peer(
        &self,
        peer: PeerId,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher(peer)?.seal(aad, plaintext)
    }

    /// 피어로부터 받은 데이터 복호화
    pub fn decrypt_from_peer(
        &self,
        peer: PeerId,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher(peer)?.open(aad, ciphertext)
    }

    /// 평문 패킷 봉인: header || nonce || E(body) || tag
    pub fn seal_packet(&self, peer: PeerId, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if packet.len() < HEADER_SIZE {
            return Err(CryptoError::EncryptionFailed("패킷 헤더 없음".into()));
        }

        let (header, body) = packet.split_at(HEADER_SIZE);
        let sealed = self.encrypt_for_peer(peer, header, body)?;

        let mut wire = Vec::with_capacity(HEADER_SIZE + sealed.len());
        wire.extend_from_slice(header);
        wire.extend_from_slice(&sealed);
        Ok(wire)
    }

    /// 봉인된 패킷을 평문 패킷으로 복원
    pub fn open_packet(&self, peer: PeerId, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wire.len() < HEADER_SIZE + SEAL_OVERHEAD {
            return Err(CryptoError::DecryptionFailed("패킷이 너무 짧음".into()));
        }

        let (header, sealed) = wire.split_at(HEADER_SIZE);
        let body = self.decrypt_from_peer(peer, header, sealed)?;

        let mut packet = Vec::with_capacity(HEADER_SIZE + body.len());
        packet.extend_from_slice(header);
        packet.extend_from_slice(&body);
        Ok(packet)
    }
}

impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("public", &self.keypair.public_key_bytes())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

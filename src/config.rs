//! 전송 계층 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::SEAL_OVERHEAD;
use crate::fault::TestMode;
use crate::packet::{ACK_SIZE, BLOCK_HEADER_SIZE, HEADER_SIZE};
use crate::{Error, Result, MAX_PACKET_SIZE, RETRANSMIT_MAX_ATTEMPTS, RETRANSMIT_TIME_MS};

/// NDT 전송 계층 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 봉인 후 패킷 최대 크기 (바이트)
    pub max_packet_size: usize,

    /// 블록당 최대 전송 시도 횟수 (첫 전송 포함)
    pub retransmit_max_attempts: u32,

    /// 재전송 간격 (밀리초)
    pub retransmit_interval_ms: u64,

    /// 재전송 스캐너 주기 (밀리초)
    /// 셔플 윈도우 플러시도 이 주기로 수행
    pub scan_interval_ms: u64,

    /// 수신 버퍼 크기 (한 데이터그램)
    pub recv_buffer_size: usize,

    /// 컨슈머 등록 전 수신 큐 상한 (None이면 무제한)
    pub inbound_queue_limit: Option<usize>,

    /// 피어별 중복 블록 필터 크기 (시퀀스 번호 개수, 0이면 비활성)
    pub duplicate_window: usize,

    /// 장애 주입 모드
    pub test_mode: TestMode,

    /// LostPackets 모드의 손실 비율 (0.0 ~ 1.0)
    pub loss_ratio: f64,

    /// ShufflePackets 모드의 재정렬 윈도우 (패킷 수)
    pub shuffle_window: usize,

    /// 장애 주입 RNG 시드 (같은 시드 → 같은 결정)
    pub fault_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            retransmit_max_attempts: RETRANSMIT_MAX_ATTEMPTS,
            retransmit_interval_ms: RETRANSMIT_TIME_MS, // 10초
            scan_interval_ms: 250,
            recv_buffer_size: 65535,
            inbound_queue_limit: None,
            duplicate_window: 1024,
            test_mode: TestMode::None,
            loss_ratio: 0.3,
            shuffle_window: 4,
            fault_seed: 0x5EED,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 재전송 간격
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    /// 스캐너 주기
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        // 최소한 블록 하나(1바이트)나 ACK 하나는 실려야 함
        let min_packet = SEAL_OVERHEAD + HEADER_SIZE + (BLOCK_HEADER_SIZE + 1).max(ACK_SIZE);
        if self.max_packet_size < min_packet {
            return Err(Error::InvalidConfig(format!(
                "max_packet_size {} < {}",
                self.max_packet_size, min_packet
            )));
        }
        if self.retransmit_max_attempts == 0 {
            return Err(Error::InvalidConfig("retransmit_max_attempts는 1 이상".into()));
        }
        if self.retransmit_interval_ms == 0 || self.scan_interval_ms == 0 {
            return Err(Error::InvalidConfig("재전송/스캔 주기는 0보다 커야 함".into()));
        }
        if self.recv_buffer_size < self.max_packet_size {
            return Err(Error::InvalidConfig(format!(
                "recv_buffer_size {} < max_packet_size {}",
                self.recv_buffer_size, self.max_packet_size
            )));
        }
        if !(0.0..=1.0).contains(&self.loss_ratio) {
            return Err(Error::InvalidConfig(format!(
                "loss_ratio {} 범위 밖",
                self.loss_ratio
            )));
        }
        if self.shuffle_window == 0 {
            return Err(Error::InvalidConfig("shuffle_window는 1 이상".into()));
        }
        Ok(())
    }

    /// 로컬 네트워크용 설정 (빠른 재전송)
    pub fn lan() -> Self {
        Self {
            retransmit_max_attempts: 8,
            retransmit_interval_ms: 200,
            scan_interval_ms: 20,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            retransmit_max_attempts: 20,
            retransmit_interval_ms: 3000,
            scan_interval_ms: 100,
            duplicate_window: 4096,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.max_packet_size, 512);
        assert_eq!(config.retransmit_max_attempts, 10);
        assert_eq!(config.retransmit_interval(), Duration::from_secs(10));
        assert_eq!(config.test_mode, TestMode::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(Config::lan().validate().is_ok());
        assert!(Config::unstable_network().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let tiny = Config {
            max_packet_size: 32,
            ..Config::default()
        };
        assert!(matches!(tiny.validate(), Err(Error::InvalidConfig(_))));

        let no_attempts = Config {
            retransmit_max_attempts: 0,
            ..Config::default()
        };
        assert!(no_attempts.validate().is_err());

        let bad_ratio = Config {
            loss_ratio: 1.5,
            ..Config::default()
        };
        assert!(bad_ratio.validate().is_err());

        let small_buffer = Config {
            recv_buffer_size: 100,
            ..Config::default()
        };
        assert!(small_buffer.validate().is_err());
    }
}

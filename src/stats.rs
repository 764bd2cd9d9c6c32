//! 전송 통계

use std::time::{Duration, Instant};

/// 전송 계층 통계
#[derive(Debug, Clone)]
pub struct TransportStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 소켓으로 보낸 패킷 수
    pub packets_sent: u64,

    /// 소켓에서 받은 패킷 수
    pub packets_received: u64,

    /// 보낸 바이트 (봉인 후)
    pub bytes_sent: u64,

    /// 받은 바이트
    pub bytes_received: u64,

    /// send() 로 등록된 블록 수
    pub blocks_sent: u64,

    /// 재전송된 블록 수
    pub blocks_retransmitted: u64,

    /// ACK로 완료된 블록 수
    pub blocks_acked: u64,

    /// 시도 횟수를 소진한 블록 수
    pub blocks_failed: u64,

    /// 컨슈머/큐로 넘긴 블록 수
    pub blocks_delivered: u64,

    /// 중복으로 걸러진 블록 수
    pub duplicate_blocks: u64,

    /// 큐 상한/종료로 버린 블록 수
    pub dropped_blocks: u64,

    /// 보낸 ACK 항목 수
    pub acks_sent: u64,

    /// DATA 패킷에 다시 실어 보낸 ACK 사본 수
    pub acks_piggybacked: u64,

    /// 디코딩 실패 패킷 수
    pub malformed_packets: u64,

    /// 복호화/인증 실패 패킷 수
    pub decrypt_failures: u64,

    /// 알 수 없는 송신자 패킷 수
    pub unknown_sender_packets: u64,

    /// 소켓 전송 에러 수
    pub send_errors: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            blocks_sent: 0,
            blocks_retransmitted: 0,
            blocks_acked: 0,
            blocks_failed: 0,
            blocks_delivered: 0,
            duplicate_blocks: 0,
            dropped_blocks: 0,
            acks_sent: 0,
            acks_piggybacked: 0,
            malformed_packets: 0,
            decrypt_failures: 0,
            unknown_sender_packets: 0,
            send_errors: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 재전송 비율 (재전송 / 등록 블록)
    pub fn retransmit_ratio(&self) -> f64 {
        if self.blocks_sent == 0 {
            return 0.0;
        }
        self.blocks_retransmitted as f64 / self.blocks_sent as f64
    }

    /// 버린 수신 패킷 합계
    pub fn rejected_packets(&self) -> u64 {
        self.malformed_packets + self.decrypt_failures + self.unknown_sender_packets
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Blocks: sent {} / acked {} / failed {} / retx {} ({:.1}%) | Delivered: {} (dup {}) | Packets: {} out / {} in | Rejected: {}",
            self.elapsed().as_secs_f64(),
            self.blocks_sent,
            self.blocks_acked,
            self.blocks_failed,
            self.blocks_retransmitted,
            self.retransmit_ratio() * 100.0,
            self.blocks_delivered,
            self.duplicate_blocks,
            self.packets_sent,
            self.packets_received,
            self.rejected_packets(),
        )
    }
}

impl Default for TransportStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios() {
        let mut stats = TransportStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);

        stats.blocks_sent = 10;
        stats.blocks_retransmitted = 5;
        assert!((stats.retransmit_ratio() - 0.5).abs() < f64::EPSILON);

        stats.malformed_packets = 1;
        stats.decrypt_failures = 2;
        stats.unknown_sender_packets = 3;
        assert_eq!(stats.rejected_packets(), 6);
        assert!(stats.summary().contains("retx 5 (50.0%)"));
    }
}

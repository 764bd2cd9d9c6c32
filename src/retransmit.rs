//! 재전송 엔진
//!
//! 블록 상태: PENDING → (ACK) → ACKED, PENDING → (시도 횟수 소진) → FAILED.
//! 두 종료 상태 모두 테이블에서 제거된다.
//!
//! - 등록 시 attempts = 1, 마감 = now + 재전송 간격 (첫 전송은 호출자가 즉시 수행)
//! - 스캔 시 마감이 지난 블록은 attempts < max 이면 재전송 대상, 아니면 실패
//! - ACK와 재전송이 겹치면 ACK가 이긴다

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::packet::Block;
use crate::peer::PeerId;
use crate::{Config, Error};

/// ACK 대기 중인 블록
#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub peer: PeerId,

    /// 등록 시점에 디렉터리에서 얻은 주소
    pub addr: SocketAddr,

    pub seq: u32,

    pub payload: Bytes,

    /// 지금까지 전송 시도 횟수
    pub attempts: u32,

    /// 다음 재전송 시각
    pub next_retry: Instant,
}

impl PendingBlock {
    pub fn new(peer: PeerId, addr: SocketAddr, seq: u32, payload: Bytes, next_retry: Instant) -> Self {
        Self {
            peer,
            addr,
            seq,
            payload,
            attempts: 1,
            next_retry,
        }
    }

    /// 코덱용 블록
    pub fn block(&self) -> Block {
        Block::new(self.seq, self.payload.clone())
    }
}

/// 재전송 실패 통지
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub peer: PeerId,
    pub seq: u32,
    pub attempts: u32,
    pub payload: Bytes,
}

impl DeliveryFailure {
    pub fn to_error(&self) -> Error {
        Error::RetransmissionExhausted {
            peer: self.peer,
            seq: self.seq,
            attempts: self.attempts,
        }
    }
}

/// 블록 상태 조회 결과
///
/// ACK와 실패 모두 테이블에서 제거되므로 종료된 블록은 `Retired` 하나로 보인다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Pending { attempts: u32 },
    Retired,
}

/// 스캔 결과
#[derive(Debug, Default)]
pub struct DueBlocks {
    /// 재전송할 블록 (피어, 시퀀스 순 정렬)
    pub retry: Vec<PendingBlock>,

    /// 시도 횟수를 소진한 블록
    pub failed: Vec<DeliveryFailure>,
}

impl DueBlocks {
    pub fn is_empty(&self) -> bool {
        self.retry.is_empty() && self.failed.is_empty()
    }
}

/// 재전송 엔진
pub struct RetransmitEngine {
    /// (피어, 시퀀스) → 대기 블록
    pending: Mutex<HashMap<(PeerId, u32), PendingBlock>>,

    max_attempts: u32,

    interval: Duration,
}

impl RetransmitEngine {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.retransmit_max_attempts, config.retransmit_interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 첫 전송 직전에 블록 등록
    pub fn register(&self, peer: PeerId, addr: SocketAddr, seq: u32, payload: Bytes, now: Instant) {
        let block = PendingBlock::new(peer, addr, seq, payload, now + self.interval);
        self.pending.lock().insert((peer, seq), block);
    }

    /// ACK 처리. 제거된 블록 수 반환 (중복 ACK는 0)
    pub fn acknowledge(&self, peer: PeerId, seqs: &[u32]) -> usize {
        if seqs.is_empty() {
            return 0;
        }

        let mut pending = self.pending.lock();
        let removed = seqs
            .iter()
            .filter(|&&seq| pending.remove(&(peer, seq)).is_some())
            .count();

        if removed > 0 {
            debug!("ACK 처리: peer={}, {}/{} 블록 완료", peer, removed, seqs.len());
        }
        removed
    }

    /// 마감이 지난 블록 수집
    ///
    /// 한 번의 락 안에서 재전송 대상은 attempts 증가 + 마감 재설정,
    /// 실패 블록은 제거한다.
    pub fn collect_due(&self, now: Instant) -> DueBlocks {
        let mut due = DueBlocks::default();
        let mut exhausted = Vec::new();

        let mut pending = self.pending.lock();
        for (key, block) in pending.iter_mut() {
            if block.next_retry > now {
                continue;
            }

            if block.attempts < self.max_attempts {
                block.attempts += 1;
                block.next_retry = now + self.interval;
                due.retry.push(block.clone());
            } else {
                exhausted.push(*key);
            }
        }

        for key in exhausted {
            if let Some(block) = pending.remove(&key) {
                due.failed.push(DeliveryFailure {
                    peer: block.peer,
                    seq: block.seq,
                    attempts: block.attempts,
                    payload: block.payload,
                });
            }
        }
        drop(pending);

        due.retry.sort_by_key(|block| (block.peer, block.seq));
        due.failed.sort_by_key(|failure| (failure.peer, failure.seq));
        due
    }

    /// 스캔 이후 ACK된 블록을 재전송 목록에서 제외
    pub fn retain_pending(&self, blocks: &mut Vec<PendingBlock>) {
        let pending = self.pending.lock();
        blocks.retain(|block| pending.contains_key(&(block.peer, block.seq)));
    }

    pub fn state(&self, peer: PeerId, seq: u32) -> BlockState {
        match self.attempts(peer, seq) {
            Some(attempts) => BlockState::Pending { attempts },
            None => BlockState::Retired,
        }
    }

    pub fn is_pending(&self, peer: PeerId, seq: u32) -> bool {
        self.pending.lock().contains_key(&(peer, seq))
    }

    /// 대기 블록의 현재 시도 횟수
    pub fn attempts(&self, peer: PeerId, seq: u32) -> Option<u32> {
        self.pending.lock().get(&(peer, seq)).map(|block| block.attempts)
    }

    /// 가장 이른 재전송 마감
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.lock().values().map(|block| block.next_retry).min()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// 전체 폐기 (종료 시)
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }
}

impl std::fmt::Debug for RetransmitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetransmitEngine")
            .field("pending", &self.len())
            .field("max_attempts", &self.max_attempts)
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn engine(max_attempts: u32) -> RetransmitEngine {
        RetransmitEngine::new(max_attempts, SECOND * 10)
    }

    #[test]
    fn test_retry_until_exhausted() {
        let engine = engine(3);
        let t0 = Instant::now();
        engine.register(PeerId(1), addr(), 5, Bytes::from_static(b"data"), t0);

        assert!(engine.collect_due(t0 + SECOND * 5).is_empty());

        let due = engine.collect_due(t0 + SECOND * 10);
        assert_eq!(due.retry.len(), 1);
        assert_eq!(due.retry[0].attempts, 2);
        assert_eq!(engine.attempts(PeerId(1), 5), Some(2));

        let due = engine.collect_due(t0 + SECOND * 20);
        assert_eq!(due.retry[0].attempts, 3);

        // 세 번째 시도 이후 마감 → 실패
        let due = engine.collect_due(t0 + SECOND * 30);
        assert!(due.retry.is_empty());
        assert_eq!(due.failed.len(), 1);
        assert_eq!(due.failed[0].attempts, 3);
        assert_eq!(due.failed[0].payload.as_ref(), b"data");
        assert!(matches!(
            due.failed[0].to_error(),
            Error::RetransmissionExhausted { seq: 5, attempts: 3, .. }
        ));

        assert!(engine.is_empty());
        assert!(engine.collect_due(t0 + SECOND * 100).is_empty());
    }

    #[test]
    fn test_single_attempt_fails_on_first_deadline() {
        let engine = engine(1);
        let t0 = Instant::now();
        engine.register(PeerId(1), addr(), 1, Bytes::new(), t0);

        let due = engine.collect_due(t0 + SECOND * 10);
        assert!(due.retry.is_empty());
        assert_eq!(due.failed.len(), 1);
        assert_eq!(due.failed[0].attempts, 1);
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let engine = engine(10);
        let t0 = Instant::now();
        engine.register(PeerId(1), addr(), 1, Bytes::new(), t0);
        engine.register(PeerId(1), addr(), 2, Bytes::new(), t0);

        assert_eq!(engine.acknowledge(PeerId(1), &[1]), 1);
        assert_eq!(engine.acknowledge(PeerId(1), &[1]), 0);
        assert_eq!(engine.acknowledge(PeerId(1), &[1, 1, 99]), 0);
        assert_eq!(engine.len(), 1);
        assert!(engine.is_pending(PeerId(1), 2));
        assert_eq!(engine.state(PeerId(1), 1), BlockState::Retired);
        assert_eq!(
            engine.state(PeerId(1), 2),
            BlockState::Pending { attempts: 1 }
        );
    }

    #[test]
    fn test_ack_is_scoped_to_peer() {
        let engine = engine(10);
        let t0 = Instant::now();
        engine.register(PeerId(1), addr(), 7, Bytes::new(), t0);
        engine.register(PeerId(2), addr(), 7, Bytes::new(), t0);

        assert_eq!(engine.acknowledge(PeerId(2), &[7]), 1);
        assert!(engine.is_pending(PeerId(1), 7));
        assert!(!engine.is_pending(PeerId(2), 7));
    }

    #[test]
    fn test_ack_wins_over_inflight_retry() {
        let engine = engine(10);
        let t0 = Instant::now();
        for seq in 0..4 {
            engine.register(PeerId(1), addr(), seq, Bytes::new(), t0);
        }

        let mut due = engine.collect_due(t0 + SECOND * 10);
        assert_eq!(
            due.retry.iter().map(|b| b.seq).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        engine.acknowledge(PeerId(1), &[1, 3]);
        engine.retain_pending(&mut due.retry);
        assert_eq!(
            due.retry.iter().map(|b| b.seq).collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[test]
    fn test_next_deadline_and_clear() {
        let engine = engine(10);
        let t0 = Instant::now();
        assert!(engine.next_deadline().is_none());

        engine.register(PeerId(1), addr(), 1, Bytes::new(), t0);
        engine.register(PeerId(1), addr(), 2, Bytes::new(), t0 + SECOND);
        assert_eq!(engine.next_deadline(), Some(t0 + SECOND * 10));

        assert_eq!(engine.clear(), 2);
        assert!(engine.is_empty());
    }
}

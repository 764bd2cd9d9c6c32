//! 수신 큐 & 디스패처
//!
//! 컨슈머 등록 전에는 수신 페이로드를 FIFO 큐에 쌓고, 등록 순간 큐를 비운 뒤
//! 이후 페이로드는 컨슈머로 바로 전달한다. 큐 상태와 컨슈머는 하나의 락으로
//! 보호되므로 전환 중에 유실되거나 두 번 전달되는 페이로드는 없다.
//!
//! 컨슈머는 락을 잡은 채 호출된다. 컨슈머 안에서 `register`를 다시 부르면 안 된다.
//! 컨슈머가 패닉하면 해당 페이로드만 버리고 수신 경로는 계속 동작한다.

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::peer::PeerId;

/// 복호화·디코딩이 끝난 수신 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    pub sender: PeerId,
    pub data: Bytes,
}

/// 페이로드 컨슈머
pub type Consumer = Arc<dyn Fn(InboundPayload) + Send + Sync>;

/// publish 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 컨슈머로 바로 전달
    Delivered,

    /// 큐에 보관
    Queued,

    /// 종료됐거나 큐가 가득 차서 버림
    Dropped,
}

struct DispatchState {
    queue: VecDeque<InboundPayload>,
    consumer: Option<Consumer>,
    closed: bool,
}

/// 컨슈머 호출. 패닉하면 false
fn invoke(consumer: &Consumer, payload: InboundPayload) -> bool {
    let sender = payload.sender;
    match panic::catch_unwind(AssertUnwindSafe(|| consumer(payload))) {
        Ok(()) => true,
        Err(_) => {
            warn!("컨슈머 패닉, {} 페이로드 버림", sender);
            false
        }
    }
}

/// 수신 디스패처
pub struct Dispatcher {
    state: Mutex<DispatchState>,
    queue_limit: Option<usize>,
}

impl Dispatcher {
    pub fn new(queue_limit: Option<usize>) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                queue: VecDeque::new(),
                consumer: None,
                closed: false,
            }),
            queue_limit,
        }
    }

    /// 수신 페이로드 게시
    pub fn publish(&self, payload: InboundPayload) -> Delivery {
        let mut state = self.state.lock();

        if state.closed {
            return Delivery::Dropped;
        }

        if let Some(consumer) = state.consumer.as_ref() {
            return if invoke(consumer, payload) {
                Delivery::Delivered
            } else {
                Delivery::Dropped
            };
        }

        if let Some(limit) = self.queue_limit {
            if state.queue.len() >= limit {
                warn!(
                    "수신 큐 가득 참 ({}), {} 페이로드 버림",
                    limit, payload.sender
                );
                return Delivery::Dropped;
            }
        }

        state.queue.push_back(payload);
        Delivery::Queued
    }

    /// 컨슈머 등록 (기존 컨슈머 교체). 큐에 쌓여 있던 페이로드 수 반환
    pub fn register(&self, consumer: Consumer) -> usize {
        let mut state = self.state.lock();

        if state.closed {
            return 0;
        }

        let consumer = state.consumer.insert(consumer).clone();
        let mut drained = 0;
        while let Some(payload) = state.queue.pop_front() {
            invoke(&consumer, payload);
            drained += 1;
        }

        if drained > 0 {
            debug!("컨슈머 등록: 보관 중이던 {} 페이로드 전달", drained);
        }
        drained
    }

    /// 닫기. 반환 이후 컨슈머는 다시 호출되지 않음
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.consumer = None;
        state.queue.clear();
    }

    /// 큐에 보관 중인 페이로드 수
    pub fn buffered(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn has_consumer(&self) -> bool {
        self.state.lock().consumer.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Dispatcher")
            .field("buffered", &state.queue.len())
            .field("has_consumer", &state.consumer.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

/// 최근 수신 시퀀스 윈도우
#[derive(Debug)]
struct RecentSequences {
    seen: HashSet<u32>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl RecentSequences {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, seq: u32) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }

        self.order.push_back(seq);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// 피어별 중복 블록 필터
///
/// 윈도우 밖으로 밀려난 시퀀스의 재전송본은 다시 전달될 수 있다 (at-least-once).
#[derive(Debug)]
pub struct DuplicateFilter {
    windows: DashMap<PeerId, RecentSequences>,
    capacity: usize,
}

impl DuplicateFilter {
    /// capacity 0이면 필터 비활성
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: DashMap::new(),
            capacity,
        }
    }

    /// 처음 보는 블록이면 true
    pub fn first_seen(&self, peer: PeerId, seq: u32) -> bool {
        if self.capacity == 0 {
            return true;
        }

        self.windows
            .entry(peer)
            .or_insert_with(|| RecentSequences::new(self.capacity))
            .insert(seq)
    }

    pub fn forget(&self, peer: PeerId) {
        self.windows.remove(&peer);
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(i: u8) -> InboundPayload {
        InboundPayload {
            sender: PeerId(1),
            data: Bytes::from(vec![i]),
        }
    }

    fn collector() -> (Consumer, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer: Consumer = Arc::new(move |p: InboundPayload| sink.lock().push(p.data[0]));
        (consumer, seen)
    }

    #[test]
    fn test_buffer_then_drain_in_order() {
        let dispatcher = Dispatcher::new(None);
        for i in 0..5 {
            assert_eq!(dispatcher.publish(payload(i)), Delivery::Queued);
        }
        assert_eq!(dispatcher.buffered(), 5);

        let (consumer, seen) = collector();
        assert_eq!(dispatcher.register(consumer), 5);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(dispatcher.buffered(), 0);

        // 이후는 직접 전달
        assert_eq!(dispatcher.publish(payload(5)), Delivery::Delivered);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_register_replaces_consumer() {
        let dispatcher = Dispatcher::new(None);
        let (first, first_seen) = collector();
        let (second, second_seen) = collector();

        dispatcher.register(first);
        dispatcher.publish(payload(1));
        assert_eq!(dispatcher.register(second), 0);
        dispatcher.publish(payload(2));

        assert_eq!(*first_seen.lock(), vec![1]);
        assert_eq!(*second_seen.lock(), vec![2]);
    }

    #[test]
    fn test_queue_limit_drops_newest() {
        let dispatcher = Dispatcher::new(Some(2));
        assert_eq!(dispatcher.publish(payload(0)), Delivery::Queued);
        assert_eq!(dispatcher.publish(payload(1)), Delivery::Queued);
        assert_eq!(dispatcher.publish(payload(2)), Delivery::Dropped);

        let (consumer, seen) = collector();
        dispatcher.register(consumer);
        assert_eq!(*seen.lock(), vec![0, 1]);
    }

    #[test]
    fn test_close_stops_delivery() {
        let dispatcher = Dispatcher::new(None);
        let (consumer, seen) = collector();
        dispatcher.register(consumer);
        dispatcher.close();

        assert_eq!(dispatcher.publish(payload(1)), Delivery::Dropped);
        assert!(seen.lock().is_empty());
        assert!(!dispatcher.has_consumer());

        let (late, late_seen) = collector();
        assert_eq!(dispatcher.register(late), 0);
        dispatcher.publish(payload(2));
        assert!(late_seen.lock().is_empty());
    }

    #[test]
    fn test_concurrent_publish_during_register() {
        // 등록과 게시가 겹쳐도 전부 한 번씩, 순서대로 전달
        let dispatcher = Arc::new(Dispatcher::new(None));
        let publisher = {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || {
                for i in 0..200u8 {
                    dispatcher.publish(payload(i));
                }
            })
        };

        let (consumer, seen) = collector();
        dispatcher.register(consumer);
        publisher.join().unwrap();

        assert_eq!(*seen.lock(), (0..200u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicate_filter_window() {
        let filter = DuplicateFilter::new(3);
        assert!(filter.first_seen(PeerId(1), 10));
        assert!(!filter.first_seen(PeerId(1), 10));
        assert!(filter.first_seen(PeerId(2), 10));

        assert!(filter.first_seen(PeerId(1), 11));
        assert!(filter.first_seen(PeerId(1), 12));
        assert!(filter.first_seen(PeerId(1), 13));

        // 10은 윈도우에서 밀려남
        assert!(filter.first_seen(PeerId(1), 10));
        assert!(!filter.first_seen(PeerId(1), 13));
    }

    #[test]
    fn test_panicking_consumer_is_isolated() {
        let dispatcher = Dispatcher::new(None);
        dispatcher.publish(payload(0));
        dispatcher.publish(payload(1));

        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let faulty: Consumer = Arc::new(move |p: InboundPayload| {
            *counter.lock() += 1;
            if p.data[0] == 0 {
                panic!("consumer failure");
            }
        });

        // 첫 페이로드에서 패닉해도 나머지는 계속 비움
        assert_eq!(dispatcher.register(faulty), 2);
        assert_eq!(*calls.lock(), 2);
        assert_eq!(dispatcher.buffered(), 0);

        assert_eq!(dispatcher.publish(payload(0)), Delivery::Dropped);
        assert_eq!(dispatcher.publish(payload(2)), Delivery::Delivered);

        // 락이 풀려 있어 교체도 가능
        let (consumer, seen) = collector();
        dispatcher.register(consumer);
        assert_eq!(dispatcher.publish(payload(3)), Delivery::Delivered);
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_duplicate_filter_forget_and_clear() {
        let filter = DuplicateFilter::new(8);
        filter.first_seen(PeerId(1), 5);
        filter.first_seen(PeerId(2), 5);

        filter.forget(PeerId(1));
        assert!(filter.first_seen(PeerId(1), 5));
        assert!(!filter.first_seen(PeerId(2), 5));

        filter.clear();
        assert!(filter.first_seen(PeerId(2), 5));
    }

    #[test]
    fn test_duplicate_filter_disabled() {
        let filter = DuplicateFilter::new(0);
        assert!(filter.first_seen(PeerId(1), 1));
        assert!(filter.first_seen(PeerId(1), 1));
    }
}

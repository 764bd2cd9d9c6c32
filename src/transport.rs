//! 전송 계층 파사드
//!
//! 외부 코드가 만지는 유일한 표면. 두 개의 백그라운드 태스크를 돌린다.
//!
//! - 리스너: 소켓 수신 → 장애 주입 → 복호화 → 디코딩 → ACK 처리 / 중복 필터 → 디스패처 → ACK 응답
//! - 타이머: 재전송 스캔 → 피어별 코얼레싱 재전송 → 실패 통지 → 셔플 윈도우 flush
//!
//! 종료는 `watch` 신호로 두 태스크의 대기를 깨운 뒤 join 한다.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::crypto::{CryptoSession, KeyPair, SessionKey, PUBLIC_KEY_SIZE};
use crate::dispatch::{Consumer, Delivery, Dispatcher, DuplicateFilter, InboundPayload};
use crate::fault::{Datagram, Direction, FaultInjector, TestMode};
use crate::packet::{Block, PacketCodec};
use crate::peer::{Directory, PeerId, PeerInfo};
use crate::retransmit::{DeliveryFailure, PendingBlock, RetransmitEngine};
use crate::socket::DatagramSocket;
use crate::stats::TransportStats;
use crate::{Config, Error, Result};

/// 피어별로 보관하는 ACK 사본 수 (다음 DATA 패킷에 동봉)
const ACK_BACKLOG_LIMIT: usize = 64;

/// 트레이트 메서드용 future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 피어 전송 계층 기능 집합
pub trait PeerTransport: Send + Sync {
    /// 목적지 피어로 페이로드 전송. 첫 전송이 나가면 시퀀스 번호 반환
    fn send<'a>(&'a self, destination: PeerId, payload: Bytes) -> BoxFuture<'a, Result<u32>>;

    /// 수신 컨슈머 등록
    fn receive(&self, consumer: Consumer);

    fn set_test_mode(&self, mode: TestMode);

    /// 종료 (멱등)
    fn shutdown<'a>(&'a self) -> BoxFuture<'a, ()>;
}

/// 태스크 간 공유 상태
struct Inner {
    config: Config,
    local_id: PeerId,
    socket: RwLock<Option<Arc<dyn DatagramSocket>>>,
    directory: Arc<dyn Directory>,
    crypto: CryptoSession,
    codec: PacketCodec,
    retransmit: RetransmitEngine,
    dispatcher: Dispatcher,
    duplicates: DuplicateFilter,
    fault: FaultInjector,
    stats: RwLock<TransportStats>,
    closed: AtomicBool,

    /// 피어별 다음 시퀀스 번호
    next_seq: DashMap<PeerId, u32>,

    /// 이미 ACK 패킷으로 보낸 시퀀스의 사본. 같은 피어로 가는 DATA 패킷에 실림
    ack_backlog: DashMap<PeerId, Vec<u32>>,

    /// failures()를 호출하기 전에는 None. 아무도 듣지 않으면 실패 통지를 쌓지 않음
    failures_tx: Mutex<Option<mpsc::UnboundedSender<DeliveryFailure>>>,
    failures_taken: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// 보안·신뢰 데이터그램 전송 계층
pub struct Transport {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// 주어진 소켓으로 전송 계층 시작
    ///
    /// tokio 런타임 안에서 호출해야 한다. 리스너와 타이머 태스크를 띄운다.
    pub fn start(
        config: Config,
        local_id: impl Into<PeerId>,
        keypair: KeyPair,
        directory: Arc<dyn Directory>,
        socket: Arc<dyn DatagramSocket>,
    ) -> Result<Self> {
        config.validate()?;

        let local_id = local_id.into();
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            local_id,
            socket: RwLock::new(Some(socket.clone())),
            directory,
            crypto: CryptoSession::new(keypair),
            codec: PacketCodec::new(config.max_packet_size),
            retransmit: RetransmitEngine::from_config(&config),
            dispatcher: Dispatcher::new(config.inbound_queue_limit),
            duplicates: DuplicateFilter::new(config.duplicate_window),
            fault: FaultInjector::from_config(&config),
            stats: RwLock::new(TransportStats::new()),
            closed: AtomicBool::new(false),
            next_seq: DashMap::new(),
            ack_backlog: DashMap::new(),
            failures_tx: Mutex::new(None),
            failures_taken: AtomicBool::new(false),
            shutdown_tx,
            config,
        });

        let listener = tokio::spawn(run_listener(
            inner.clone(),
            socket,
            inner.shutdown_tx.subscribe(),
        ));
        let timer = tokio::spawn(run_timer(inner.clone(), inner.shutdown_tx.subscribe()));

        info!(
            "{} 전송 계층 시작: {} (재전송 {}회 x {:?})",
            local_id,
            local_addr,
            inner.retransmit.max_attempts(),
            inner.retransmit.interval()
        );

        Ok(Self {
            inner,
            tasks: Mutex::new(vec![listener, timer]),
        })
    }

    /// UDP 소켓을 바인드해서 시작
    pub async fn bind(
        config: Config,
        local_id: impl Into<PeerId>,
        keypair: KeyPair,
        directory: Arc<dyn Directory>,
        addr: SocketAddr,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::start(config, local_id, keypair, directory, Arc::new(socket))
    }

    /// 페이로드 전송
    ///
    /// 블록을 재전송 테이블에 등록하고 첫 전송을 내보낸 뒤 시퀀스 번호를 반환한다.
    /// ACK는 기다리지 않는다. 재시도 소진은 [`Transport::failures`]로 통지된다.
    pub async fn send(&self, destination: PeerId, payload: impl Into<Bytes>) -> Result<u32> {
        let payload = payload.into();
        let inner = &self.inner;
        let mut shutdown = inner.shutdown_tx.subscribe();
        inner.ensure_open()?;

        let max = inner.codec.max_block_payload();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let peer = inner.directory.resolve(destination)?;
        inner.crypto.establish(&peer)?;

        let seq = inner.allocate_seq(destination);
        let acks = inner.take_acks(destination);
        let encoded = inner
            .codec
            .encode(inner.local_id, &[Block::new(seq, payload.clone())], &acks)?;
        inner.stats.write().acks_piggybacked += encoded.acks_taken as u64;
        let wire = inner.crypto.seal_packet(destination, &encoded.bytes)?;

        // 첫 전송보다 먼저 등록해야 빠른 ACK를 놓치지 않음
        inner
            .retransmit
            .register(destination, peer.addr, seq, payload, Instant::now());
        inner.stats.write().blocks_sent += 1;

        tokio::select! {
            _ = inner.transmit(Datagram::new(peer.addr, wire)) => {}
            _ = shutdown.changed() => return Err(Error::Interrupted),
        }

        debug!("{} → {} 블록 #{} 전송", inner.local_id, destination, seq);
        Ok(seq)
    }

    /// 수신 컨슈머 등록
    ///
    /// 등록 전에 쌓인 페이로드는 도착 순서대로 먼저 전달된다. 다시 등록하면 교체된다.
    pub fn receive<F>(&self, consumer: F)
    where
        F: Fn(InboundPayload) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(Arc::new(consumer));
    }

    /// 채널로 수신
    pub fn receive_channel(&self) -> mpsc::UnboundedReceiver<InboundPayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.receive(move |payload| {
            // 수신측이 사라졌으면 버림
            let _ = tx.send(payload);
        });
        rx
    }

    /// 재전송 실패 통지 수신기 (한 번만 꺼낼 수 있음)
    ///
    /// 채널은 이 호출 시점에 만들어진다. 그 전에 실패한 블록은 통계에만 남는다.
    pub fn failures(&self) -> Option<mpsc::UnboundedReceiver<DeliveryFailure>> {
        if self.inner.failures_taken.swap(true, Ordering::SeqCst) {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.failures_tx.lock() = Some(tx);
        Some(rx)
    }

    pub fn set_test_mode(&self, mode: TestMode) {
        info!("{} 테스트 모드: {:?}", self.inner.local_id, mode);
        self.inner.fault.set_mode(mode);
    }

    pub fn test_mode(&self) -> TestMode {
        self.inner.fault.mode()
    }

    /// 외부에서 합의된 세션 키 설치
    pub fn install_session_key(&self, peer: PeerId, key: &SessionKey) {
        self.inner.crypto.install_session_key(peer, key);
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.inner.crypto.public_key_bytes()
    }

    pub fn has_session(&self, peer: PeerId) -> bool {
        self.inner.crypto.has_session(peer)
    }

    /// 피어 상태 폐기 (세션 키, 중복 필터, 시퀀스 카운터, ACK 사본)
    ///
    /// 피어가 키를 교체하고 재시작했을 때 사용한다. 다음 송수신에서 디렉터리로 다시 세션을 만든다.
    /// 이미 대기 중인 블록은 건드리지 않는다.
    pub fn forget_peer(&self, peer: PeerId) {
        let inner = &self.inner;
        inner.crypto.forget(peer);
        inner.duplicates.forget(peer);
        inner.next_seq.remove(&peer);
        inner.ack_backlog.remove(&peer);
        debug!("{} 피어 상태 폐기: {}", inner.local_id, peer);
    }

    /// 종료
    ///
    /// 두 태스크가 끝날 때까지 기다린 뒤 디스패처를 닫고 대기 블록과 소켓을 정리한다.
    /// 여러 번 호출해도 안전하다.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("태스크 종료 에러: {}", e);
            }
        }

        self.inner.dispatcher.close();
        let abandoned = self.inner.retransmit.clear();
        self.inner.fault.flush(Direction::Outgoing);
        self.inner.fault.flush(Direction::Incoming);
        self.inner.duplicates.clear();
        self.inner.ack_backlog.clear();
        self.inner.failures_tx.lock().take();
        self.inner.socket.write().take();

        info!(
            "{} 전송 계층 종료 (미완료 블록 {}개 폐기) | {}",
            self.inner.local_id,
            abandoned,
            self.inner.stats.read().summary()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> TransportStats {
        self.inner.stats.read().clone()
    }

    /// ACK 대기 중인 블록 수
    pub fn pending_count(&self) -> usize {
        self.inner.retransmit.len()
    }

    /// 큐에 보관 중인 수신 페이로드 수
    pub fn buffered_count(&self) -> usize {
        self.inner.dispatcher.buffered()
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.inner.socket().ok_or(Error::Closed)?;
        Ok(socket.local_addr()?)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown_tx.send_replace(true);
        self.inner.dispatcher.close();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_id", &self.inner.local_id)
            .field("closed", &self.is_closed())
            .field("retransmit", &self.inner.retransmit)
            .field("dispatcher", &self.inner.dispatcher)
            .field("fault", &self.inner.fault)
            .finish()
    }
}

impl PeerTransport for Transport {
    fn send<'a>(&'a self, destination: PeerId, payload: Bytes) -> BoxFuture<'a, Result<u32>> {
        Box::pin(Transport::send(self, destination, payload))
    }

    fn receive(&self, consumer: Consumer) {
        self.inner.dispatcher.register(consumer);
    }

    fn set_test_mode(&self, mode: TestMode) {
        Transport::set_test_mode(self, mode);
    }

    fn shutdown<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(Transport::shutdown(self))
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn socket(&self) -> Option<Arc<dyn DatagramSocket>> {
        self.socket.read().clone()
    }

    /// 피어별 시퀀스 할당. 시작값은 무작위, 오버플로 시 순환
    fn allocate_seq(&self, peer: PeerId) -> u32 {
        let mut next = self.next_seq.entry(peer).or_insert_with(rand::random::<u32>);
        let seq = *next;
        *next = seq.wrapping_add(1);
        seq
    }

    /// ACK 사본 보관 (오래된 것부터 밀려남)
    fn remember_acks(&self, peer: PeerId, acks: &[u32]) {
        let mut backlog = self.ack_backlog.entry(peer).or_default();
        backlog.extend_from_slice(acks);
        if backlog.len() > ACK_BACKLOG_LIMIT {
            let excess = backlog.len() - ACK_BACKLOG_LIMIT;
            backlog.drain(..excess);
        }
    }

    /// 동봉할 ACK 사본 꺼내기. 패킷에 못 실은 나머지는 이미 한 번 보낸 것이라 버린다
    fn take_acks(&self, peer: PeerId) -> Vec<u32> {
        self.ack_backlog
            .remove(&peer)
            .map(|(_, acks)| acks)
            .unwrap_or_default()
    }

    /// 재전송 실패 통지. 수신기가 없거나 닫혔으면 보관하지 않음
    fn report_failure(&self, failure: DeliveryFailure) {
        let mut failures_tx = self.failures_tx.lock();
        if let Some(tx) = failures_tx.as_ref() {
            if tx.send(failure).is_err() {
                *failures_tx = None;
            }
        }
    }

    /// 장애 주입기를 거쳐 전송
    async fn transmit(&self, datagram: Datagram) {
        for datagram in self.fault.outgoing(datagram) {
            self.send_datagram(datagram).await;
        }
    }

    /// 소켓으로 직접 전송. 실패해도 블록은 대기 상태로 남아 타이머가 재시도
    async fn send_datagram(&self, datagram: Datagram) {
        let Some(socket) = self.socket() else {
            return;
        };

        match socket.send_to(&datagram.data, datagram.addr).await {
            Ok(sent) => {
                let mut stats = self.stats.write();
                stats.packets_sent += 1;
                stats.bytes_sent += sent as u64;
            }
            Err(e) => {
                warn!("{} 전송 에러 ({}): {}", self.local_id, datagram.addr, e);
                self.stats.write().send_errors += 1;
            }
        }
    }

    /// 수신 데이터그램 처리 (장애 주입 이후)
    async fn handle_datagram(&self, datagram: Datagram) {
        {
            let mut stats = self.stats.write();
            stats.packets_received += 1;
            stats.bytes_received += datagram.data.len() as u64;
        }

        match self.process_packet(&datagram) {
            Ok(Some((peer, acks))) => self.send_acks(&peer, &acks).await,
            Ok(None) => {}
            Err(e) => {
                let mut stats = self.stats.write();
                match e {
                    Error::MalformedPacket { .. } => stats.malformed_packets += 1,
                    Error::UnknownPeer { .. } => stats.unknown_sender_packets += 1,
                    Error::Crypto(_) => stats.decrypt_failures += 1,
                    _ => {}
                }
                drop(stats);
                debug!("{} 패킷 폐기 ({}): {}", self.local_id, datagram.addr, e);
            }
        }
    }

    /// 복호화·디코딩 후 ACK와 블록 처리. ACK로 돌려줄 시퀀스 반환
    fn process_packet(&self, datagram: &Datagram) -> Result<Option<(PeerInfo, Vec<u32>)>> {
        let header = self.codec.peek_header(&datagram.data)?;
        let peer = self.directory.resolve(header.sender)?;
        self.crypto.establish(&peer)?;

        let plain = self.crypto.open_packet(peer.id, &datagram.data)?;
        let packet = self.codec.decode(&plain)?;

        let acked = self.retransmit.acknowledge(peer.id, &packet.acks);
        if packet.blocks.is_empty() {
            self.stats.write().blocks_acked += acked as u64;
            return Ok(None);
        }

        let mut acks = Vec::with_capacity(packet.blocks.len());
        if !packet.acks.is_empty() {
            debug!(
                "{} ← {} DATA 패킷에 ACK {}개 동봉",
                self.local_id,
                peer.id,
                packet.acks.len()
            );
        }
        let mut delivered = 0u64;
        let mut duplicates = 0u64;
        let mut dropped = 0u64;

        for block in packet.blocks {
            // 중복이어도 ACK는 다시 보냄 (이전 ACK가 유실됐을 수 있음)
            acks.push(block.seq);

            if !self.duplicates.first_seen(peer.id, block.seq) {
                duplicates += 1;
                continue;
            }

            let payload = InboundPayload {
                sender: peer.id,
                data: block.payload,
            };
            match self.dispatcher.publish(payload) {
                Delivery::Delivered | Delivery::Queued => delivered += 1,
                Delivery::Dropped => dropped += 1,
            }
        }

        {
            let mut stats = self.stats.write();
            stats.blocks_acked += acked as u64;
            stats.blocks_delivered += delivered;
            stats.duplicate_blocks += duplicates;
            stats.dropped_blocks += dropped;
        }

        Ok(Some((peer, acks)))
    }

    /// ACK 전용 패킷 전송 (한 패킷에 다 안 들어가면 나눠서)
    async fn send_acks(&self, peer: &PeerInfo, acks: &[u32]) {
        self.remember_acks(peer.id, acks);

        let mut rest = acks;
        while !rest.is_empty() {
            let encoded = match self.codec.encode(self.local_id, &[], rest) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("{} ACK 인코딩 에러: {}", self.local_id, e);
                    return;
                }
            };
            rest = &rest[encoded.acks_taken..];

            let wire = match self.crypto.seal_packet(peer.id, &encoded.bytes) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!("{} ACK 암호화 에러: {}", self.local_id, e);
                    return;
                }
            };

            self.stats.write().acks_sent += encoded.acks_taken as u64;
            self.transmit(Datagram::new(peer.addr, wire)).await;
        }
    }

    /// 재전송 스캔 한 번
    async fn scan(&self, now: Instant) {
        let mut due = self.retransmit.collect_due(now);

        for failure in due.failed {
            warn!(
                "{} → {} 블록 #{} 전송 실패 ({}회 시도)",
                self.local_id, failure.peer, failure.seq, failure.attempts
            );
            self.stats.write().blocks_failed += 1;
            self.report_failure(failure);
        }

        self.retransmit.retain_pending(&mut due.retry);

        // 피어, 시퀀스 순으로 정렬되어 있음
        let mut remaining = due.retry.as_slice();
        while let Some(first) = remaining.first() {
            let split = remaining
                .iter()
                .position(|block| block.peer != first.peer)
                .unwrap_or(remaining.len());
            let (group, rest) = remaining.split_at(split);
            self.retransmit_group(group).await;
            remaining = rest;
        }

        for datagram in self.fault.flush(Direction::Outgoing) {
            self.send_datagram(datagram).await;
        }
        for datagram in self.fault.flush(Direction::Incoming) {
            self.handle_datagram(datagram).await;
        }
    }

    /// 같은 피어의 재전송 블록을 패킷 한도까지 묶어서 전송
    async fn retransmit_group(&self, group: &[PendingBlock]) {
        let Some(first) = group.first() else {
            return;
        };
        let (peer, addr) = (first.peer, first.addr);

        let blocks: Vec<Block> = group.iter().map(PendingBlock::block).collect();
        let acks = self.take_acks(peer);
        let mut rest = blocks.as_slice();
        let mut acks_rest = acks.as_slice();
        while !rest.is_empty() {
            let encoded = match self.codec.encode(self.local_id, rest, acks_rest) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("{} 재전송 인코딩 에러: {}", self.local_id, e);
                    return;
                }
            };
            rest = &rest[encoded.blocks_taken..];
            acks_rest = &acks_rest[encoded.acks_taken..];

            let wire = match self.crypto.seal_packet(peer, &encoded.bytes) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!("{} 재전송 암호화 에러: {}", self.local_id, e);
                    return;
                }
            };

            debug!(
                "{} → {} 블록 {}개 재전송",
                self.local_id, peer, encoded.blocks_taken
            );
            {
                let mut stats = self.stats.write();
                stats.blocks_retransmitted += encoded.blocks_taken as u64;
                stats.acks_piggybacked += encoded.acks_taken as u64;
            }
            self.transmit(Datagram::new(addr, wire)).await;
        }
    }
}

/// 리스너를 끝내야 하는 소켓 에러
fn is_fatal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
    )
}

async fn run_listener(
    inner: Arc<Inner>,
    socket: Arc<dyn DatagramSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; inner.config.recv_buffer_size];

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, addr)) => {
                        let datagram = Datagram::new(addr, Bytes::copy_from_slice(&buf[..len]));
                        for datagram in inner.fault.incoming(datagram) {
                            inner.handle_datagram(datagram).await;
                        }
                    }
                    Err(e) if is_fatal(&e) => {
                        error!("{} 소켓 닫힘, 리스너 종료: {}", inner.local_id, e);
                        break;
                    }
                    Err(e) => {
                        warn!("{} 수신 에러: {}", inner.local_id, e);
                    }
                }
            }
        }
    }

    debug!("{} 리스너 종료", inner.local_id);
}

async fn run_timer(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => inner.scan(Instant::now()).await,
        }
    }

    debug!("{} 타이머 종료", inner.local_id);
}

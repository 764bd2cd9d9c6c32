//! 장애 주입 (테스트 모드)
//!
//! 코덱과 소켓 사이에서 패킷의 존재/순서만 바꾼다. 내용은 절대 건드리지 않는다.
//! 시드 고정 RNG를 쓰므로 같은 시드, 같은 입력이면 같은 결과가 나온다.

use std::net::SocketAddr;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::Config;

/// 장애 주입 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestMode {
    /// 그대로 통과
    #[default]
    None,

    /// 일정 비율 패킷 손실
    LostPackets,

    /// 윈도우 단위 재정렬
    ShufflePackets,
}

/// 주소가 붙은 데이터그램
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub data: Bytes,
}

impl Datagram {
    pub fn new(addr: SocketAddr, data: impl Into<Bytes>) -> Self {
        Self {
            addr,
            data: data.into(),
        }
    }
}

/// 패킷 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

struct FaultState {
    mode: TestMode,
    rng: StdRng,
    held_outgoing: Vec<Datagram>,
    held_incoming: Vec<Datagram>,
    dropped: u64,
}

impl FaultState {
    fn held(&mut self, direction: Direction) -> &mut Vec<Datagram> {
        match direction {
            Direction::Outgoing => &mut self.held_outgoing,
            Direction::Incoming => &mut self.held_incoming,
        }
    }

    /// 보류 패킷 방출 (셔플 모드면 섞어서)
    fn release(&mut self, direction: Direction) -> Vec<Datagram> {
        let mut released = std::mem::take(self.held(direction));
        if self.mode == TestMode::ShufflePackets {
            released.shuffle(&mut self.rng);
        }
        released
    }
}

/// 장애 주입기
pub struct FaultInjector {
    state: Mutex<FaultState>,
    loss_ratio: f64,
    shuffle_window: usize,
}

impl FaultInjector {
    pub fn new(mode: TestMode, loss_ratio: f64, shuffle_window: usize, seed: u64) -> Self {
        Self {
            state: Mutex::new(FaultState {
                mode,
                rng: StdRng::seed_from_u64(seed),
                held_outgoing: Vec::new(),
                held_incoming: Vec::new(),
                dropped: 0,
            }),
            loss_ratio: loss_ratio.clamp(0.0, 1.0),
            shuffle_window: shuffle_window.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.test_mode,
            config.loss_ratio,
            config.shuffle_window,
            config.fault_seed,
        )
    }

    pub fn mode(&self) -> TestMode {
        self.state.lock().mode
    }

    /// 모드 변경. 보류 중인 패킷은 다음 flush에서 방출
    pub fn set_mode(&self, mode: TestMode) {
        self.state.lock().mode = mode;
    }

    /// 지금까지 버린 패킷 수
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// 패킷 하나를 통과시키고, 지금 전달할 패킷 목록을 반환
    pub fn apply(&self, direction: Direction, datagram: Datagram) -> Vec<Datagram> {
        let mut state = self.state.lock();

        match state.mode {
            TestMode::None => {
                let mut out = state.release(direction);
                out.push(datagram);
                out
            }
            TestMode::LostPackets => {
                let mut out = state.release(direction);
                if state.rng.gen_bool(self.loss_ratio) {
                    state.dropped += 1;
                } else {
                    out.push(datagram);
                }
                out
            }
            TestMode::ShufflePackets => {
                state.held(direction).push(datagram);
                if state.held(direction).len() >= self.shuffle_window {
                    state.release(direction)
                } else {
                    Vec::new()
                }
            }
        }
    }

    pub fn outgoing(&self, datagram: Datagram) -> Vec<Datagram> {
        self.apply(Direction::Outgoing, datagram)
    }

    pub fn incoming(&self, datagram: Datagram) -> Vec<Datagram> {
        self.apply(Direction::Incoming, datagram)
    }

    /// 덜 찬 윈도우 강제 방출 (타이머에서 호출)
    pub fn flush(&self, direction: Direction) -> Vec<Datagram> {
        self.state.lock().release(direction)
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FaultInjector")
            .field("mode", &state.mode)
            .field("loss_ratio", &self.loss_ratio)
            .field("shuffle_window", &self.shuffle_window)
            .field("dropped", &state.dropped)
            .finish()
    }
}

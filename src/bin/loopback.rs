//! NDT 루프백 데모
//!
//! 로컬 UDP 위에서 두 노드를 띄워 페이로드를 주고받고 통계를 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin ndt-loopback -- [OPTIONS]
//!
//! 예시:
//!   # 기본 100개 전송
//!   cargo run --release --bin ndt-loopback
//!
//!   # 30% 손실 환경
//!   cargo run --release --bin ndt-loopback -- --mode lost --loss 0.3

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ndt::{Config, KeyPair, PeerId, PeerInfo, StaticDirectory, TestMode, Transport};

/// 데모 설정
struct LoopbackConfig {
    count: usize,
    payload_size: usize,
    mode: TestMode,
    deadline: Duration,
    config: Config,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            count: 100,
            payload_size: 200,
            mode: TestMode::None,
            deadline: Duration::from_secs(30),
            config: Config::lan(),
        }
    }
}

fn parse_args() -> LoopbackConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = LoopbackConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    config.count = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < args.len() {
                    config.payload_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--mode" | "-m" => {
                if i + 1 < args.len() {
                    config.mode = match args[i + 1].as_str() {
                        "lost" => TestMode::LostPackets,
                        "shuffle" => TestMode::ShufflePackets,
                        _ => TestMode::None,
                    };
                    i += 1;
                }
            }
            "--loss" => {
                if i + 1 < args.len() {
                    config.config.loss_ratio = args[i + 1].parse().expect("0.0 ~ 1.0 필요");
                    i += 1;
                }
            }
            "--seed" => {
                if i + 1 < args.len() {
                    config.config.fault_seed = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--deadline" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("초 단위 숫자 필요");
                    config.deadline = Duration::from_secs(secs);
                    i += 1;
                }
            }
            "--standard" => {
                // 실제 프로토콜 상수 (10초 x 10회)
                config.config = Config::default();
            }
            "--help" | "-h" => {
                println!(
                    r#"NDT Loopback - 노드 간 전송 계층 데모

사용법:
  cargo run --release --bin ndt-loopback -- [OPTIONS]

옵션:
  -n, --count <N>        전송할 페이로드 수 (기본: 100)
  -s, --size <BYTES>     페이로드 크기 (기본: 200, 최대 466)
  -m, --mode <MODE>      테스트 모드: none | lost | shuffle
  --loss <RATIO>         lost 모드 손실률 (기본: 0.3)
  --seed <N>             장애 주입 시드
  --deadline <SECS>      최대 대기 시간 (기본: 30)
  --standard             LAN 프리셋 대신 기본 재전송 설정 사용
  -h, --help             이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let demo = parse_args();
    let bind: SocketAddr = "127.0.0.1:0".parse()?;
    let directory = Arc::new(StaticDirectory::new());

    let alice_keys = KeyPair::generate();
    let bob_keys = KeyPair::generate();
    let alice_public = alice_keys.public_key_bytes();
    let bob_public = bob_keys.public_key_bytes();

    let alice = Transport::bind(demo.config.clone(), 1u32, alice_keys, directory.clone(), bind).await?;
    let bob = Transport::bind(demo.config.clone(), 2u32, bob_keys, directory.clone(), bind).await?;

    directory.insert(PeerInfo::new(1u32, alice.local_addr()?, alice_public));
    directory.insert(PeerInfo::new(2u32, bob.local_addr()?, bob_public));

    alice.set_test_mode(demo.mode);
    bob.set_test_mode(demo.mode);

    let mut inbox = bob.receive_channel();
    let mut failures = alice.failures();

    info!(
        "{}개 x {} bytes 전송 ({:?})",
        demo.count, demo.payload_size, demo.mode
    );

    let started = Instant::now();
    for i in 0..demo.count {
        let mut payload = vec![0u8; demo.payload_size.max(4)];
        payload[..4].copy_from_slice(&(i as u32).to_be_bytes());
        alice.send(PeerId(2), payload).await?;
    }

    let mut received = HashSet::new();
    let mut failed = 0usize;
    let deadline = tokio::time::sleep(demo.deadline);
    tokio::pin!(deadline);

    while received.len() + failed < demo.count {
        tokio::select! {
            Some(payload) = inbox.recv() => {
                if payload.data.len() >= 4 {
                    let id = u32::from_be_bytes([payload.data[0], payload.data[1], payload.data[2], payload.data[3]]);
                    received.insert(id);
                }
            }
            Some(failure) = async { match failures.as_mut() { Some(rx) => rx.recv().await, None => None } } => {
                warn!("전송 실패: {} #{} ({}회)", failure.peer, failure.seq, failure.attempts);
                failed += 1;
            }
            _ = &mut deadline => {
                warn!("대기 시간 초과");
                break;
            }
        }
    }

    info!(
        "수신 {}/{} (실패 {}) - {:.2}s",
        received.len(),
        demo.count,
        failed,
        started.elapsed().as_secs_f64()
    );
    info!("alice: {}", alice.stats().summary());
    info!("bob:   {}", bob.stats().summary());

    alice.shutdown().await;
    bob.shutdown().await;

    Ok(())
}

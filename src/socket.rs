//! 데이터그램 I/O 경계
//!
//! 전송 계층은 `send_to` / `recv_from` 두 가지만 필요하다.
//! 실제 UDP 소켓([`tokio::net::UdpSocket`])과 테스트용 메모리 네트워크를 제공한다.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// 소켓 연산 future
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// UDP 최대 페이로드
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// 데이터그램 소켓
pub trait DatagramSocket: Send + Sync + 'static {
    /// 데이터그램 전송. 매체가 크기나 주소를 거부하면 실패
    fn send_to<'a>(&'a self, data: &'a [u8], addr: SocketAddr) -> IoFuture<'a, usize>;

    /// 데이터그램 수신. 도착하거나 소켓이 닫힐 때까지 대기
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, (usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to<'a>(&'a self, data: &'a [u8], addr: SocketAddr) -> IoFuture<'a, usize> {
        Box::pin(UdpSocket::send_to(self, data, addr))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, (usize, SocketAddr)> {
        Box::pin(UdpSocket::recv_from(self, buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

type Inbox = mpsc::UnboundedSender<(SocketAddr, Bytes)>;

/// 프로세스 내부 데이터그램 네트워크 (테스트용)
///
/// 바인드되지 않은 주소로 보낸 데이터그램은 UDP처럼 조용히 사라진다.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    endpoints: DashMap<SocketAddr, Inbox>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 주소에 소켓 바인드
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> io::Result<MemorySocket> {
        use dashmap::mapref::entry::Entry;

        let (tx, rx) = mpsc::unbounded_channel();
        match self.endpoints.entry(addr) {
            Entry::Occupied(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} 이미 사용 중", addr),
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        Ok(MemorySocket {
            addr,
            network: self.clone(),
            inbox: Mutex::new(rx),
        })
    }

    /// 바인드된 소켓 수
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) -> io::Result<usize> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("데이터그램 크기 초과: {} bytes", data.len()),
            ));
        }

        if let Some(inbox) = self.endpoints.get(&to) {
            // 수신측이 이미 닫혔으면 유실
            let _ = inbox.send((from, Bytes::copy_from_slice(data)));
        }
        Ok(data.len())
    }
}

/// 메모리 네트워크 소켓
#[derive(Debug)]
pub struct MemorySocket {
    addr: SocketAddr,
    network: Arc<MemoryNetwork>,
    inbox: Mutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>,
}

impl DatagramSocket for MemorySocket {
    fn send_to<'a>(&'a self, data: &'a [u8], addr: SocketAddr) -> IoFuture<'a, usize> {
        Box::pin(async move { self.network.deliver(self.addr, addr, data) })
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, (usize, SocketAddr)> {
        Box::pin(async move {
            let mut inbox = self.inbox.lock().await;
            let (from, data) = inbox
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "socket closed"))?;
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            Ok((len, from))
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.endpoints.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_memory_socket_send_recv() {
        let network = MemoryNetwork::new();
        let a = network.bind(addr(1)).unwrap();
        let b = network.bind(addr(2)).unwrap();

        a.send_to(b"hello", addr(2)).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, addr(1));
    }

    #[tokio::test]
    async fn test_unbound_destination_is_silent() {
        let network = MemoryNetwork::new();
        let a = network.bind(addr(1)).unwrap();
        assert_eq!(a.send_to(b"lost", addr(99)).await.unwrap(), 4);

        let oversized = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(a.send_to(&oversized, addr(99)).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_and_release() {
        let network = MemoryNetwork::new();
        let a = network.bind(addr(1)).unwrap();
        assert!(network.bind(addr(1)).is_err());

        drop(a);
        assert_eq!(network.endpoint_count(), 0);
        assert!(network.bind(addr(1)).is_ok());
    }

    #[tokio::test]
    async fn test_udp_socket_loopback() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = DatagramSocket::local_addr(&b).unwrap();

        let sock: &dyn DatagramSocket = &a;
        sock.send_to(b"ping", b_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = DatagramSocket::recv_from(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
    }
}

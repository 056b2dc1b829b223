// 平台语音下行接收器
// 非阻塞读取 → 环形缓冲 → 按平台帧头重同步 → 定长 G.711 帧回调

use std::io::Read;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::RingBuffer;
use crate::error::{MediaError, Result};

use super::G711_FRAME_SIZE;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BUFFER_SIZE: usize = 256 * 1024;
/// 约 1.6 秒 @ 128kbit/s PCMA
const RING_CAPACITY: usize = 256 * 1024;
/// 平台帧头：`03 2C` 长度前缀 + RTP 头首两字节（V/P/X/CC 与 M|PT=PCMU）
const FRAME_MARKER: [u8; 4] = [0x03, 0x2C, 0x80, 0x88];
/// 每个数据报的固定前缀：2 字节长度 + 12 字节 RTP 头
const FRAME_HEADER_LEN: usize = 14;
const SCRATCH_SIZE: usize = 8192;
/// 可写空间低于该值时触发丢旧
const LOW_WATER_MARK: usize = 2048;

pub type AudioFrameCallback = Box<dyn Fn(&[u8]) + Send + 'static>;

/// 语音下行接收器。
///
/// 构造时绑定随机本地端口（供下行 SDP 通告），平台应答后由
/// `connect_platform` 主动连接其通告地址，`start` 启动专属读取线程。
/// 读取线程同时是环形缓冲的唯一生产者与唯一消费者。
pub struct AudioReceiver {
    local_port: u16,
    bound: Mutex<Option<Socket>>,
    stream: Mutex<Option<TcpStream>>,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    frame_count: Arc<AtomicU64>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl AudioReceiver {
    pub fn new() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        let any: SocketAddr = "0.0.0.0:0".parse().expect("static addr");
        socket.bind(&any.into())?;
        let local_port = socket
            .local_addr()?
            .as_socket()
            .map(|a| a.port())
            .ok_or_else(|| MediaError::Other("no local address".into()))?;

        tracing::info!(
            target: "audio",
            "receiver bound on port {}, ring capacity {} KiB",
            local_port,
            RING_CAPACITY / 1024
        );

        Ok(Self {
            local_port,
            bound: Mutex::new(Some(socket)),
            stream: Mutex::new(None),
            ring: Arc::new(RingBuffer::new(RING_CAPACITY)),
            running: Arc::new(AtomicBool::new(false)),
            frame_count: Arc::new(AtomicU64::new(0)),
            reader: Mutex::new(None),
        })
    }

    /// 本地端口，用于下行 SDP 的 m= 行。
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// 已收到的完整帧数。
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// 环形缓冲内未消费的字节数。
    pub fn buffered_bytes(&self) -> usize {
        self.ring.readable_size()
    }

    /// 主动连接平台通告的推流地址，5 秒内未就绪视为失败。
    pub fn connect_platform(&self, host: &str, port: u16) -> Result<()> {
        let socket = self
            .bound
            .lock()
            .unwrap()
            .take()
            .ok_or(MediaError::NotInitialized)?;
        let ip: IpAddr = host
            .parse()
            .map_err(|_| MediaError::InvalidDescriptor(format!("invalid platform host {host}")))?;
        let addr = SocketAddr::new(ip, port);

        socket
            .connect_timeout(&addr.into(), CONNECT_TIMEOUT)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    MediaError::ConnectTimeout(CONNECT_TIMEOUT)
                } else {
                    MediaError::Io(e)
                }
            })?;
        socket.set_nonblocking(true)?;

        *self.stream.lock().unwrap() = Some(socket.into());
        tracing::info!(target: "audio", "connected to platform {}:{}", host, port);
        Ok(())
    }

    /// 启动读取线程。回调在读取线程上执行，必须保持非阻塞。
    pub fn start(&self, callback: AudioFrameCallback) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MediaError::Other("receiver already started".into()));
        }
        let stream = match self.stream.lock().unwrap().as_ref() {
            Some(s) => s.try_clone(),
            None => {
                self.running.store(false, Ordering::SeqCst);
                return Err(MediaError::NotInitialized);
            }
        }?;

        let ring = Arc::clone(&self.ring);
        let running = Arc::clone(&self.running);
        let frame_count = Arc::clone(&self.frame_count);

        let handle = std::thread::Builder::new()
            .name("audio-recv".into())
            .spawn(move || receive_loop(stream, ring, running, frame_count, callback))?;
        *self.reader.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// 停止：置停止位、关闭套接字踢醒读取、合流、清空缓冲。
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(stream) = self.stream.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.ring.clear();
        self.frame_count.store(0, Ordering::Relaxed);
        tracing::info!(target: "audio", "receiver stopped");
    }
}

impl Drop for AudioReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    mut stream: TcpStream,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    frame_count: Arc<AtomicU64>,
    callback: AudioFrameCallback,
) {
    tracing::debug!(target: "audio", "receive loop started");
    let mut scratch = [0u8; SCRATCH_SIZE];
    let mut frame = [0u8; G711_FRAME_SIZE];

    while running.load(Ordering::Relaxed) {
        // 背压：宁可丢旧数据也不让平台的发送阻塞
        let mut writable = ring.writable_size();
        if writable < LOW_WATER_MARK {
            let dropped = ring.discard(ring.capacity() / 4);
            tracing::warn!(target: "audio", "ring nearly full, dropped {} stale bytes", dropped);
            writable = ring.writable_size();
        }

        let to_read = scratch.len().min(writable);
        if to_read == 0 {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        match stream.read(&mut scratch[..to_read]) {
            Ok(0) => {
                tracing::info!(target: "audio", "connection closed by platform");
                break;
            }
            Ok(n) => {
                let written = ring.write(&scratch[..n]);
                if written != n {
                    tracing::warn!(target: "audio", "ring write truncated: {}/{}", written, n);
                }
                extract_frames(&ring, &mut frame, &frame_count, &callback);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) if is_fatal(&e) => {
                tracing::warn!(target: "audio", "connection lost: {}", e);
                break;
            }
            Err(e) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                tracing::debug!(target: "audio", "transient recv error: {}", e);
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    tracing::debug!(
        target: "audio",
        "receive loop exited, {} frames delivered",
        frame_count.load(Ordering::Relaxed)
    );
}

/// 对端断开或套接字已失效，读取循环无法继续。
fn is_fatal(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::InvalidInput
    )
}

/// 平台帧结构：[03 2C][RTP 头 12 字节][N 个 160 字节 G.711 帧]
///
/// 在缓冲内搜索帧头完成重同步；帧头之前的字节视为上一数据报的残余负载，
/// 按整帧回调、零头丢弃。搜不到帧头且积压超过 2 KiB 时丢 1 KiB 防止
/// 失步后无限增长。
fn extract_frames(
    ring: &RingBuffer,
    frame: &mut [u8; G711_FRAME_SIZE],
    frame_count: &AtomicU64,
    callback: &AudioFrameCallback,
) {
    let mut probe = [0u8; FRAME_MARKER.len()];
    loop {
        let readable = ring.readable_size();
        let mut marker_at = None;
        let mut offset = 0usize;
        while offset + FRAME_HEADER_LEN <= readable {
            if ring.peek(&mut probe, offset) == probe.len() && probe == FRAME_MARKER {
                marker_at = Some(offset);
                break;
            }
            offset += 1;
        }

        let Some(marker_at) = marker_at else {
            if readable > 2048 {
                tracing::warn!(target: "audio", "{} bytes without frame marker, dropping 1024", readable);
                ring.discard(1024);
            }
            return;
        };

        // 帧头之前的残余音频
        let mut remaining = marker_at;
        while remaining >= G711_FRAME_SIZE {
            ring.read(frame);
            callback(&frame[..]);
            frame_count.fetch_add(1, Ordering::Relaxed);
            remaining -= G711_FRAME_SIZE;
        }
        if remaining > 0 {
            ring.discard(remaining);
        }

        // 跳过 2 字节长度前缀 + 12 字节 RTP 头
        ring.discard(FRAME_HEADER_LEN);

        // 连续取整帧，碰到下一个帧头交还给外层重扫
        while ring.readable_size() >= G711_FRAME_SIZE {
            if ring.peek(&mut probe, 0) == probe.len() && probe == FRAME_MARKER {
                break;
            }
            ring.read(frame);
            callback(&frame[..]);
            frame_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn datagram(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&[0x03, 0x2C]);
        out.extend_from_slice(&[0x80, 0x88]);
        out.extend_from_slice(&[0u8; 10]); // RTP 头其余字段
        out.extend_from_slice(payload);
        out
    }

    fn start_connected() -> (AudioReceiver, TcpStream, mpsc::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let receiver = AudioReceiver::new().unwrap();
        receiver.connect_platform("127.0.0.1", port).unwrap();
        let (platform, _) = listener.accept().unwrap();

        let (tx, rx) = mpsc::channel();
        receiver
            .start(Box::new(move |frame| {
                let _ = tx.send(frame.to_vec());
            }))
            .unwrap();
        (receiver, platform, rx)
    }

    #[test]
    fn test_single_frame_after_garbage_prefix() {
        let (receiver, mut platform, rx) = start_connected();

        // 残留垃圾 + 帧头 + 一帧 0x55
        let mut wire = vec![0xAA, 0xBB, 0xCC];
        wire.extend_from_slice(&datagram(&[0x55; G711_FRAME_SIZE]));
        platform.write_all(&wire).unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.len(), G711_FRAME_SIZE);
        assert!(frame.iter().all(|&b| b == 0x55));

        // 零头（3 字节垃圾）被丢弃，缓冲应当排空
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(receiver.buffered_bytes(), 0);
        assert_eq!(receiver.frame_count(), 1);
        receiver.stop();
    }

    #[test]
    fn test_multiple_frames_in_one_datagram() {
        let (receiver, mut platform, rx) = start_connected();

        let mut payload = Vec::new();
        payload.extend_from_slice(&[0x11; G711_FRAME_SIZE]);
        payload.extend_from_slice(&[0x22; G711_FRAME_SIZE]);
        platform.write_all(&datagram(&payload)).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(first.iter().all(|&b| b == 0x11));
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(second.iter().all(|&b| b == 0x22));
        receiver.stop();
    }

    #[test]
    fn test_consecutive_datagrams() {
        let (receiver, mut platform, rx) = start_connected();

        let mut wire = Vec::new();
        wire.extend_from_slice(&datagram(&[0x0F; G711_FRAME_SIZE]));
        wire.extend_from_slice(&datagram(&[0xF0; G711_FRAME_SIZE]));
        platform.write_all(&wire).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(first.iter().all(|&b| b == 0x0F));
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(second.iter().all(|&b| b == 0xF0));
        assert_eq!(receiver.frame_count(), 2);
        receiver.stop();
    }

    #[test]
    fn test_stop_joins_and_clears() {
        let (receiver, mut platform, rx) = start_connected();
        platform.write_all(&datagram(&[0x33; G711_FRAME_SIZE])).unwrap();
        let _ = rx.recv_timeout(Duration::from_secs(2)).unwrap();

        receiver.stop();
        assert_eq!(receiver.buffered_bytes(), 0);
        assert_eq!(receiver.frame_count(), 0);
    }

    #[test]
    fn test_peer_close_ends_loop() {
        let (receiver, platform, _rx) = start_connected();
        drop(platform);

        // 对端关闭后读取线程应自行退出
        std::thread::sleep(Duration::from_millis(100));
        receiver.stop();
    }

    #[test]
    fn test_local_port_allocated() {
        let receiver = AudioReceiver::new().unwrap();
        assert_ne!(receiver.local_port(), 0);
    }
}

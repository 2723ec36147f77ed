//! 连接处理
//!
//! 每个客户端连接一个线程：读取 → 累积到终止序列 → 切帧 → 分发 → 编码 → 写回 → flush。
//! 每个连接另有一个看门狗线程，入站数据静默超过上限时关闭 socket，使阻塞的读取返回。

use crate::config::DaemonConfig;
use crate::dispatch::{ConnectionState, DispatchOutcome, Dispatcher};
use crate::error::RequestError;
use crate::liveness::{LivenessMonitor, Watchdog};
use crate::stats::ServerStats;
use camshare_protocol::{FrameDecoder, Response, encode_frame};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 连接级参数（从 [`DaemonConfig`] 提取）
#[derive(Debug, Clone, Copy)]
pub struct HandlerConfig {
    pub liveness_timeout: Duration,
    pub liveness_check_interval: Duration,
    pub max_frame_bytes: usize,
    pub release_on_disconnect: bool,
}

impl From<&DaemonConfig> for HandlerConfig {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            liveness_timeout: config.liveness_timeout(),
            liveness_check_interval: config.liveness_check_interval(),
            max_frame_bytes: config.max_frame_bytes,
            release_on_disconnect: config.release_on_disconnect,
        }
    }
}

/// 连接结束的原因
#[derive(Debug)]
pub enum CloseReason {
    /// 客户端发送了 `bye`
    Bye,
    /// 对端关闭
    PeerClosed,
    /// 入站静默超时
    LivenessTimeout,
    /// 读写出错
    Io(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Bye => write!(f, "client said bye"),
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::LivenessTimeout => write!(f, "liveness timeout"),
            CloseReason::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

/// 单个连接的处理器
pub struct ConnectionHandler {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnectionState,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ServerStats>,
    config: HandlerConfig,
}

impl ConnectionHandler {
    pub fn new(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<ServerStats>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            stream,
            peer,
            state: ConnectionState::new(id),
            dispatcher,
            stats,
            config,
        }
    }

    /// 处理连接直到关闭（阻塞）
    pub fn run(mut self) {
        let id = self.state.id;
        self.stats.connection_opened();
        info!("[conn {}] Accepted {}", id, self.peer);

        let monitor = Arc::new(LivenessMonitor::new(self.config.liveness_timeout));
        let watchdog = match self.spawn_watchdog(Arc::clone(&monitor)) {
            Ok(watchdog) => Some(watchdog),
            Err(e) => {
                error!("[conn {}] Failed to start liveness watchdog: {}", id, e);
                None
            },
        };

        let reason = match self.serve(&monitor) {
            CloseReason::PeerClosed | CloseReason::Io(_)
                if watchdog.as_ref().is_some_and(Watchdog::fired) =>
            {
                CloseReason::LivenessTimeout
            },
            reason => reason,
        };
        drop(watchdog);
        let _ = self.stream.shutdown(Shutdown::Both);

        self.release_held_refs();
        self.stats.connection_closed();
        info!("[conn {}] Closed ({})", id, reason);
    }

    fn spawn_watchdog(&self, monitor: Arc<LivenessMonitor>) -> io::Result<Watchdog> {
        let stream = self.stream.try_clone()?;
        Watchdog::spawn(
            format!("conn-{}-watchdog", self.state.id),
            monitor,
            self.config.liveness_check_interval,
            move || {
                let _ = stream.shutdown(Shutdown::Both);
            },
        )
    }

    fn serve(&mut self, monitor: &LivenessMonitor) -> CloseReason {
        let mut decoder = FrameDecoder::with_limit(self.config.max_frame_bytes);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match self.stream.read(&mut buf) {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return CloseReason::Io(e),
            };
            monitor.touch();
            decoder.push(&buf[..n]);

            while let Some(frame) = decoder.next_frame() {
                let outcome = match frame {
                    Ok(text) => self.dispatcher.handle_frame(&text, &mut self.state),
                    Err(e) => self.dispatcher.reject(&self.state, RequestError::from(e)),
                };
                match outcome {
                    DispatchOutcome::Reply(response) => {
                        if let Err(e) = self.write_response(&response) {
                            return CloseReason::Io(e);
                        }
                    },
                    DispatchOutcome::Silent => {},
                    DispatchOutcome::Close(response) => {
                        if let Err(e) = self.write_response(&response) {
                            return CloseReason::Io(e);
                        }
                        return CloseReason::Bye;
                    },
                }
            }
        }
    }

    fn write_response(&mut self, response: &Response) -> io::Result<()> {
        let bytes = match encode_frame(response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("[conn {}] Failed to encode response: {}", self.state.id, e);
                encode_frame(&Response::error(format!("Failed to encode response: {}", e)))
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            },
        };
        self.stream.write_all(&bytes)?;
        self.stream.flush()
    }

    fn release_held_refs(&mut self) {
        let held = self.state.held_refs;
        if held == 0 {
            return;
        }
        if self.config.release_on_disconnect {
            let camera = self.dispatcher.camera();
            for _ in 0..held {
                camera.disconnect();
            }
            self.state.held_refs = 0;
            info!(
                "[conn {}] Released {} device reference(s) left by the client",
                self.state.id, held
            );
        } else {
            warn!(
                "[conn {}] Client vanished holding {} device reference(s); they stay in use",
                self.state.id, held
            );
        }
    }
}

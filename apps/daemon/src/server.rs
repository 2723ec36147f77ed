//! 传输监听
//!
//! 绑定回环地址，接受连接，为每个连接启动一个处理线程。
//! 接受循环以非阻塞方式轮询关闭标志。关闭时先停止接受新连接，
//! 在宽限期内等待已有连接自行结束；宽限期过后停止读取剩余连接的新请求，
//! 等正在执行的请求回复完毕再返回。

use crate::config::DaemonConfig;
use crate::dispatch::Dispatcher;
use crate::error::DaemonError;
use crate::handler::{ConnectionHandler, HandlerConfig};
use crate::stats::ServerStats;
use camshare_driver::SharedCamera;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 接受循环的轮询间隔
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 关闭信号（可跨线程克隆）
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// 已启动的连接处理线程
struct ActiveConnection {
    id: u64,
    /// 用于关闭时切断读取
    stream: TcpStream,
    thread: JoinHandle<()>,
}

/// 守护进程监听器
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ServerStats>,
    handler_config: HandlerConfig,
    shutdown_grace: Duration,
    shutdown: ShutdownHandle,
    next_id: AtomicU64,
    connections: Vec<ActiveConnection>,
}

impl Server {
    /// 绑定监听地址
    pub fn bind(config: &DaemonConfig, camera: Arc<SharedCamera>) -> Result<Self, DaemonError> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).map_err(|source| DaemonError::Bind {
            addr: config.bind_addr,
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let stats = Arc::new(ServerStats::new());
        Ok(Self {
            listener,
            local_addr,
            dispatcher: Arc::new(Dispatcher::new(camera, Arc::clone(&stats))),
            stats,
            handler_config: HandlerConfig::from(config),
            shutdown_grace: config.shutdown_grace(),
            shutdown: ShutdownHandle::default(),
            next_id: AtomicU64::new(1),
            connections: Vec::new(),
        })
    }

    /// 实际监听地址（绑定端口 0 时由系统分配）
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// 运行接受循环直到收到关闭信号，然后等待连接处理线程结束（阻塞）
    ///
    /// 返回时所有处理线程都已退出，它们持有的相机引用也已释放。
    pub fn run(mut self) -> Result<(), DaemonError> {
        info!("Listening on {}", self.local_addr);

        while !self.shutdown.is_triggered() {
            self.connections.retain(|conn| !conn.thread.is_finished());
            let accepted = self.listener.accept();
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = self.spawn_handler(stream, peer) {
                        error!("Failed to start handler for {}: {}", peer, e);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => {
                    // 文件描述符耗尽等情况：稍后重试，不退出
                    warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                },
            }
        }

        info!(
            "Listener stopped ({} connection(s) still active)",
            self.stats.active_connections()
        );
        self.drain();
        Ok(())
    }

    /// 等待连接处理线程结束
    fn drain(&mut self) {
        let deadline = Instant::now().checked_add(self.shutdown_grace);
        while deadline.is_none_or(|deadline| Instant::now() < deadline)
            && self.connections.iter().any(|conn| !conn.thread.is_finished())
        {
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }

        for conn in &self.connections {
            if !conn.thread.is_finished() {
                info!(
                    "[conn {}] Shutdown grace period over, no longer reading requests",
                    conn.id
                );
                // 阻塞中的读取立即返回 EOF，进行中的请求照常回复
                let _ = conn.stream.shutdown(Shutdown::Read);
            }
        }

        for conn in self.connections.drain(..) {
            if conn.thread.join().is_err() {
                error!("[conn {}] Handler thread panicked", conn.id);
            }
        }
        info!("All connections drained");
    }

    /// 在后台线程运行接受循环
    pub fn spawn(self) -> io::Result<JoinHandle<Result<(), DaemonError>>> {
        thread::Builder::new()
            .name("listener".into())
            .spawn(move || self.run())
    }

    fn spawn_handler(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        // 部分平台上 accept 得到的 socket 继承监听 socket 的非阻塞属性
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let control = stream.try_clone()?;
        let handler = ConnectionHandler::new(
            id,
            stream,
            peer,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.stats),
            self.handler_config,
        );
        let thread = thread::Builder::new()
            .name(format!("conn-{}", id))
            .spawn(move || handler.run())?;
        self.connections.push(ActiveConnection {
            id,
            stream: control,
            thread,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camshare_driver::{SimulatedCamera, SimulatorConfig};

    fn camera() -> Arc<SharedCamera> {
        Arc::new(SharedCamera::new(SimulatedCamera::new(
            SimulatorConfig::default(),
        )))
    }

    fn ephemeral_config() -> DaemonConfig {
        DaemonConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let server = Server::bind(&ephemeral_config(), camera()).unwrap();
        assert!(server.local_addr().ip().is_loopback());
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn test_bind_conflict_reports_address() {
        let first = Server::bind(&ephemeral_config(), camera()).unwrap();
        let config = DaemonConfig {
            bind_addr: first.local_addr(),
            ..DaemonConfig::default()
        };
        match Server::bind(&config, camera()) {
            Err(DaemonError::Bind { addr, .. }) => assert_eq!(addr, first.local_addr()),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("second bind on the same port succeeded"),
        }
    }

    #[test]
    fn test_shutdown_stops_listener() {
        let server = Server::bind(&ephemeral_config(), camera()).unwrap();
        let shutdown = server.shutdown_handle();
        let handle = server.spawn().unwrap();

        shutdown.trigger();
        assert!(handle.join().unwrap().is_ok());
    }
}

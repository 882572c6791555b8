//! The connection engine: a single reactor thread multiplexing every
//! client socket, a worker pool building responses, and the write path
//! that resumes partial sends under write-readiness.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::conn::{Connection, ConnectionTable};
use crate::epoll::{self, Epoll};
use crate::error::ServerResult;
use crate::files::FileResponder;
use crate::logging;
use crate::pool::WorkerPool;
use crate::rate_limit::RateLimiter;
use crate::request::{self, Method, Request};
use crate::response::{Response, Status, SERVER_NAME};
use crate::sock;

/// Bytes pulled off a socket per readiness event.
const BUFFER_SIZE: usize = 4096;
/// Hard cap on an accumulated request (headers + body).
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
/// Reactor wait bound; also paces idle reaping and shutdown latency.
const POLL_TIMEOUT_MS: i32 = 1000;
/// Idle connections older than this are reaped.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Kernel receive timeout set on accepted sockets.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Listen backlog.
const BACKLOG: i32 = 128;

#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    pub enabled: bool,
    pub rate: f64,
    pub burst: f64,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 100.0,
            burst: 200.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: Ipv4Addr,
    pub port: u16,
    /// Worker threads; 0 auto-detects.
    pub workers: usize,
    pub max_connections: usize,
    pub document_root: PathBuf,
    pub default_file: String,
    /// 0 disables the content cache.
    pub cache_size_bytes: usize,
    pub cache_ttl_seconds: i64,
    pub rate_limit: RateLimitOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: 8080,
            workers: 0,
            max_connections: crate::config::DEFAULT_MAX_CONNECTIONS,
            document_root: PathBuf::from("./public"),
            default_file: "index.html".to_string(),
            cache_size_bytes: 100 * 1024 * 1024,
            cache_ttl_seconds: 300,
            rate_limit: RateLimitOptions::default(),
        }
    }
}

/// Everything the reactor and the workers share.
struct Engine {
    epoll: Epoll,
    table: ConnectionTable,
    pool: WorkerPool,
    files: FileResponder,
    limiter: RateLimiter,
    running: AtomicBool,
}

impl Engine {
    /// Drain the accept queue. Each accepted descriptor becomes an owned
    /// `Connection` immediately so every failure path closes it exactly
    /// once, via drop.
    fn accept_all(&self, listener_fd: RawFd) {
        loop {
            let (fd, peer) = match sock::accept(listener_fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            };

            let conn = Arc::new(Connection::new(fd, peer));

            if self.table.len() >= self.table.max_connections() {
                tracing::warn!(%peer, "connection cap reached, dropping new connection");
                continue;
            }
            if let Err(e) =
                sock::set_nodelay(fd).and_then(|()| sock::set_recv_timeout(fd, RECV_TIMEOUT))
            {
                tracing::debug!(fd, error = %e, "socket setup failed");
                continue;
            }
            if let Err(e) = self.epoll.register(fd, epoll::READABLE) {
                tracing::warn!(fd, error = %e, "epoll registration failed");
                continue;
            }
            if self.table.insert(conn).is_err() {
                let _ = self.epoll.deregister(fd);
                continue;
            }
            tracing::debug!(fd, %peer, "connection accepted");
        }
    }

    /// One bounded read, framing check, and possibly a dispatch. The
    /// `processing` interlock guarantees at most one in-flight worker per
    /// connection, which also serializes pipelined requests.
    fn on_readable(engine: &Arc<Engine>, fd: RawFd) {
        let Some(conn) = engine.table.get(fd) else {
            return;
        };

        let mut buf = [0u8; BUFFER_SIZE];
        let n = match sock::recv(fd, &mut buf) {
            Ok(0) => {
                engine.close_connection(fd);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::debug!(fd, error = %e, "read failed");
                engine.close_connection(fd);
                return;
            }
        };

        let dispatch = {
            let mut state = conn.lock();
            state.read_buf.extend_from_slice(&buf[..n]);
            if state.read_buf.len() > MAX_REQUEST_BYTES {
                drop(state);
                tracing::warn!(fd, "request exceeds size cap, closing");
                engine.close_connection(fd);
                return;
            }
            state.last_activity = Instant::now();
            if !state.processing && request::is_complete(&state.read_buf) {
                state.processing = true;
                true
            } else {
                false
            }
        };

        if dispatch {
            let task_engine = Arc::clone(engine);
            let task_conn = Arc::clone(&conn);
            let submitted = engine
                .pool
                .submit(move || task_engine.handle_request(&task_conn));
            if submitted.is_err() {
                // Shutdown raced the dispatch; release the interlock and
                // let the shutdown table walk take the connection down.
                conn.lock().processing = false;
            }
        }
    }

    fn on_writable(&self, fd: RawFd) {
        let Some(conn) = self.table.get(fd) else {
            return;
        };
        self.send_attempt(&conn);
    }

    /// Worker entry: parse, dispatch, stage the response, then try to
    /// push it out inline. The read buffer is held stable underneath us by
    /// the `processing` flag. Outcomes are signalled only through the
    /// connection fields; the reactor owns descriptor lifecycle except for
    /// the inline send below.
    fn handle_request(&self, conn: &Arc<Connection>) {
        let raw = conn.lock().read_buf.clone();

        let mut keep_alive = false;
        let (mut response, method, path) = match Request::parse(&raw) {
            Err(e) => {
                tracing::debug!(peer = %conn.peer(), error = %e, "unparseable request");
                let response = Response::error(Status::BadRequest, "Invalid HTTP request");
                (response, "-".to_string(), "-".to_string())
            }
            Ok(req) => {
                keep_alive = req.is_keep_alive();
                let response = self.dispatch(&req, conn);
                (response, req.method.as_str().to_string(), req.path)
            }
        };

        // Client input errors and server errors terminate the connection
        // regardless of what the request asked for.
        if matches!(
            response.status,
            Status::BadRequest | Status::MethodNotAllowed | Status::InternalServerError
        ) {
            keep_alive = false;
        }

        response.set_keep_alive(keep_alive);
        let status = response.status.code();
        let bytes = response.to_bytes();
        logging::log_access(conn.peer().ip(), &method, &path, status, bytes.len());

        {
            let mut state = conn.lock();
            state.keep_alive = keep_alive;
            state.write_buf = bytes;
            state.write_offset = 0;
            state.has_pending_write = true;
            state.read_buf.clear();
            state.processing = false;
        }
        self.send_attempt(conn);
    }

    fn dispatch(&self, req: &Request, conn: &Arc<Connection>) -> Response {
        if !self.limiter.check(&conn.peer().to_string()) {
            return Response::error(Status::ServiceUnavailable, "Too many requests");
        }

        if !matches!(req.method, Method::Get | Method::Head) {
            return Response::error(Status::MethodNotAllowed, "Method not supported");
        }

        let mut response = if req.path.starts_with("/api/") {
            self.api_response(req)
        } else {
            self.files.handle(&req.path)
        };

        if req.method == Method::Head {
            response.clear_body_for_head();
        }
        response
    }

    fn api_response(&self, req: &Request) -> Response {
        if req.path != "/api/status" && req.path != "/api/info" {
            return Response::error(Status::NotFound, "API endpoint not found");
        }

        let cache = self.files.cache_stats();
        let hit_ratio_percent = (self.files.cache_hit_ratio() * 1000.0).round() / 10.0;
        let body = serde_json::json!({
            "server": SERVER_NAME,
            "timestamp": Utc::now().to_rfc3339(),
            "thread_pool_size": self.pool.thread_count(),
            "queue_size": self.pool.queue_depth(),
            "active_connections": self.table.len(),
            "document_root": self.files.document_root().display().to_string(),
            "architecture": "epoll + worker_pool + lru_cache",
            "http_version": "HTTP/1.1",
            "cache": {
                "hits": cache.hits,
                "misses": cache.misses,
                "entries": cache.entries,
                "memory_usage_bytes": cache.memory_usage,
                "hit_ratio_percent": hit_ratio_percent,
            },
        });
        let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string());
        Response::json(text)
    }

    /// Push staged bytes until drained or the kernel pushes back. Runs
    /// inline on a worker right after staging and again from the reactor
    /// on every write-readiness event.
    fn send_attempt(&self, conn: &Arc<Connection>) {
        let fd = conn.fd();
        let mut close_after = false;

        {
            let mut state = conn.lock();
            if !state.has_pending_write {
                return;
            }

            loop {
                let offset = state.write_offset;
                if offset >= state.write_buf.len() {
                    break;
                }
                match sock::send(fd, &state.write_buf[offset..]) {
                    Ok(0) => {
                        // A zero-length send on a non-empty buffer means
                        // the peer is gone.
                        close_after = true;
                        break;
                    }
                    Ok(n) => {
                        state.write_offset += n;
                        state.last_activity = Instant::now();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let _ = self.epoll.modify(fd, epoll::READABLE | epoll::WRITABLE);
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(fd, error = %e, "send failed");
                        close_after = true;
                        break;
                    }
                }
            }

            if close_after {
                state.keep_alive = false;
                state.has_pending_write = false;
                state.write_buf.clear();
                state.write_offset = 0;
            } else {
                // Fully drained: rearm for the next request or close.
                state.has_pending_write = false;
                state.write_buf.clear();
                state.write_offset = 0;
                let _ = self.epoll.modify(fd, epoll::READABLE);
                if !state.keep_alive {
                    close_after = true;
                }
            }
        }

        if close_after {
            self.close_connection(fd);
        }
    }

    /// Idempotent: removes the table handle and deregisters the fd. The
    /// descriptor closes when the last outstanding handle drops.
    fn close_connection(&self, fd: RawFd) {
        let Some(conn) = self.table.remove(fd) else {
            return;
        };
        let _ = self.epoll.deregister(fd);
        drop(conn);
        tracing::debug!(fd, "connection closed");
    }

    fn reap_idle(&self) {
        for fd in self.table.collect_idle(CONNECTION_TIMEOUT) {
            tracing::debug!(fd, "reaping idle connection");
            self.close_connection(fd);
        }
    }
}

fn reactor_loop(engine: Arc<Engine>, listener_fd: RawFd) {
    let mut events = Vec::new();

    while engine.running.load(Ordering::Acquire) {
        if let Err(e) = engine.epoll.wait(&mut events, POLL_TIMEOUT_MS) {
            tracing::error!(error = %e, "multiplexer wait failed");
            continue;
        }

        for event in &events {
            if event.fd == listener_fd {
                if event.readable() {
                    engine.accept_all(listener_fd);
                }
            } else {
                if event.readable() {
                    Engine::on_readable(&engine, event.fd);
                }
                if event.writable() {
                    engine.on_writable(event.fd);
                }
            }
        }

        engine.reap_idle();
    }

    tracing::debug!("reactor thread exiting");
}

pub struct Server {
    engine: Arc<Engine>,
    listener_fd: RawFd,
    port: u16,
    reactor: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listen socket and assemble the engine. Fatal errors here
    /// (bind, listen, epoll create) surface to the caller; the process
    /// entry turns them into a non-zero exit.
    pub fn bind(options: ServerOptions) -> ServerResult<Self> {
        let listener_fd = sock::create_listener(options.host, options.port, BACKLOG)?;
        let port = match sock::local_port(listener_fd) {
            Ok(port) => port,
            Err(e) => {
                sock::close(listener_fd);
                return Err(e.into());
            }
        };

        let epoll = match Epoll::new() {
            Ok(epoll) => epoll,
            Err(e) => {
                sock::close(listener_fd);
                return Err(e.into());
            }
        };
        if let Err(e) = epoll.register(listener_fd, epoll::READABLE) {
            sock::close(listener_fd);
            return Err(e.into());
        }

        let engine = Arc::new(Engine {
            epoll,
            table: ConnectionTable::new(options.max_connections),
            pool: WorkerPool::new(options.workers),
            files: FileResponder::new(
                options.document_root,
                &options.default_file,
                options.cache_size_bytes,
                options.cache_ttl_seconds,
            ),
            limiter: RateLimiter::new(
                options.rate_limit.rate,
                options.rate_limit.burst,
                options.rate_limit.enabled,
            ),
            running: AtomicBool::new(false),
        });

        Ok(Self {
            engine,
            listener_fd,
            port,
            reactor: None,
        })
    }

    /// Spawn the reactor thread. Idempotent.
    pub fn start(&mut self) -> ServerResult<()> {
        if self.engine.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let engine = Arc::clone(&self.engine);
        let listener_fd = self.listener_fd;
        let handle = thread::Builder::new()
            .name("plinth-reactor".to_string())
            .spawn(move || reactor_loop(engine, listener_fd))?;
        self.reactor = Some(handle);

        tracing::info!(port = self.port, "server listening");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.engine.running.load(Ordering::Acquire)
    }

    /// Port actually bound (useful when binding port 0).
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Cooperative shutdown: stop admitting work, drain the pool, join
    /// the reactor, then close every live connection.
    pub fn stop(&mut self) {
        if !self.engine.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.engine.pool.shutdown();
        if let Some(handle) = self.reactor.take() {
            let _ = handle.join();
        }
        for conn in self.engine.table.drain() {
            let _ = self.engine.epoll.deregister(conn.fd());
        }
        tracing::info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        sock::close(self.listener_fd);
    }
}

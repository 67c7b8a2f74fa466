//! 服务器实例模块
//!
//! 维护实例标识到运行中监听器的注册表，处理创建/关闭生命周期。
//! 每个被接受的连接交给 hyper 驱动；每个请求先过中间件管道，
//! 通过后包装成请求事件广播到动作通道，再等待分发器写回的响应。

pub mod cert_manager;
pub mod config;
pub mod http_request;
pub mod middleware;
pub mod response;
pub mod router;

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::http::StatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::channel::{EventBus, ReadyEvent, ServerEvent};
use crate::error::{FluxError, FluxResult};
use crate::server::cert_manager::CertManager;
use crate::server::config::{CreateConfig, ListenTarget};
use crate::server::http_request::{InboundRequest, RequestEvent};
use crate::server::middleware::{DynMiddleware, MiddlewareChain};
use crate::server::response::{RenderFn, ResponseSlot};
use crate::utils::logger::{debug, error, info, warn};

/// 服务器实例注册表
///
/// 以实例标识为键持有监听器任务句柄。标识不要求唯一：
/// 重复创建会在同一个键下积累多个互相独立的监听器，
/// 关闭按标识精确匹配并停掉该键下的全部监听器。
pub(crate) struct ServerRegistry {
    bus: Arc<EventBus>,
    root_middlewares: Vec<DynMiddleware>,
    render: RenderFn,
    instances: DashMap<String, Vec<JoinHandle<()>>>,
}

impl ServerRegistry {
    pub(crate) fn new(
        bus: Arc<EventBus>,
        root_middlewares: Vec<DynMiddleware>,
        render: RenderFn,
    ) -> Self {
        Self {
            bus,
            root_middlewares,
            render,
            instances: DashMap::new(),
        }
    }

    /// 处理 create 命令：启动一个新的监听器任务
    pub(crate) fn create(self: Arc<Self>, config: CreateConfig) {
        let id = config.id.clone();
        // 先确保事件通道存在，创建即有副作用，不依赖订阅者
        self.bus.touch(&id);
        let chain = Arc::new(MiddlewareChain::new(
            &self.root_middlewares,
            &config.middlewares,
        ));
        let handle = tokio::spawn(run_instance(config, chain, self.clone()));
        self.instances.entry(id).or_default().push(handle);
    }

    /// 处理 close 命令：停掉该标识下的全部监听器并终止事件流
    ///
    /// 已越过中间件管道的请求不受影响，其待定的发送动作仍会完成
    pub(crate) fn close(&self, id: &str) {
        if let Some((_, handles)) = self.instances.remove(id) {
            info!("🛑 [服务端] 关闭实例 {}（{} 个监听器）", id, handles.len());
            for handle in handles {
                handle.abort();
            }
        }
        self.bus.close(id);
    }

    /// 实例级致命错误：停掉监听器并以错误终止事件流
    fn fail(&self, id: &str, message: String) {
        if let Some((_, handles)) = self.instances.remove(id) {
            for handle in handles {
                handle.abort();
            }
        }
        self.bus.fail(id, message);
    }

    /// 停掉全部实例
    pub(crate) fn shutdown_all(&self) {
        let ids: Vec<String> = self.instances.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("instances", &self.instances.len())
            .field("root_middlewares", &self.root_middlewares.len())
            .finish()
    }
}

/// 单个监听器内连接处理共享的上下文
struct ConnectionContext {
    instance_id: String,
    chain: Arc<MiddlewareChain>,
    render: RenderFn,
    bus: Arc<EventBus>,
    registry: Arc<ServerRegistry>,
}

/// 监听器任务主体：解析监听目标、绑定、进入接受循环
async fn run_instance(
    mut config: CreateConfig,
    chain: Arc<MiddlewareChain>,
    registry: Arc<ServerRegistry>,
) {
    let id = config.id.clone();
    let secured = config.secured.take();

    let target = match config.take_listen_target() {
        Ok(target) => target,
        Err(e) => {
            error!("❌ [服务端] 实例 {} 监听配置非法: {}", id, e);
            registry.fail(&id, e.to_string());
            return;
        }
    };

    let acceptor = match &secured {
        Some(options) => match CertManager::new(options.clone()).build_acceptor() {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!("❌ [服务端] 实例 {} TLS 配置失败: {}", id, e);
                registry.fail(&id, e.to_string());
                return;
            }
        },
        None => None,
    };

    let context = Arc::new(ConnectionContext {
        instance_id: id.clone(),
        chain,
        render: registry.render.clone(),
        bus: registry.bus.clone(),
        registry: registry.clone(),
    });

    match target {
        ListenTarget::Handle(std_listener) => match into_tokio_listener(std_listener) {
            Ok(listener) => accept_tcp(listener, acceptor, context).await,
            Err(e) => {
                error!("❌ [服务端] 实例 {} 接管预打开句柄失败: {}", id, e);
                registry.fail(&id, e.to_string());
            }
        },
        ListenTarget::Tcp {
            port,
            hostname,
            backlog,
        } => match bind_tcp(&hostname, port, backlog).await {
            Ok(listener) => accept_tcp(listener, acceptor, context).await,
            Err(e) => {
                error!(
                    "❌ [服务端] 实例 {} 绑定 {}:{} 失败: {}",
                    id, hostname, port, e
                );
                registry.fail(&id, e.to_string());
            }
        },
        #[cfg(unix)]
        ListenTarget::Path(path) => match tokio::net::UnixListener::bind(&path) {
            Ok(listener) => accept_unix(listener, acceptor, context).await,
            Err(e) => {
                error!(
                    "❌ [服务端] 实例 {} 绑定 unix 套接字 {} 失败: {}",
                    id,
                    path.display(),
                    e
                );
                registry.fail(&id, FluxError::BindError(e).to_string());
            }
        },
    }
}

/// 按主机名/端口/backlog 绑定 TCP 监听器
async fn bind_tcp(hostname: &str, port: u16, backlog: u32) -> FluxResult<TcpListener> {
    let mut addrs = tokio::net::lookup_host((hostname, port))
        .await
        .map_err(FluxError::BindError)?;
    let addr = addrs
        .next()
        .ok_or_else(|| FluxError::NetworkError(format!("无法解析主机名: {}", hostname)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(FluxError::BindError)?;
    socket.set_reuseaddr(true).map_err(FluxError::BindError)?;
    socket.bind(addr).map_err(FluxError::BindError)?;
    socket.listen(backlog).map_err(FluxError::BindError)
}

/// 接管调用方预打开的标准库监听器
fn into_tokio_listener(listener: std::net::TcpListener) -> FluxResult<TcpListener> {
    listener.set_nonblocking(true).map_err(FluxError::BindError)?;
    TcpListener::from_std(listener).map_err(FluxError::BindError)
}

/// TCP 接受循环
///
/// 进入循环前恰好发出一次就绪事件；循环由 close 触发的任务中止结束
async fn accept_tcp(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    context: Arc<ConnectionContext>,
) {
    let local_addr = listener.local_addr().ok();
    info!(
        "🚀 [服务端] 实例 {} 开始监听 {:?} (TLS: {})",
        context.instance_id,
        local_addr,
        acceptor.is_some()
    );
    context.bus.publish(
        &context.instance_id,
        ServerEvent::Ready(ReadyEvent {
            instance_id: context.instance_id.clone(),
            local_addr,
        }),
    );

    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                let context = context.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_connection(tls_stream, context).await,
                            Err(e) => {
                                debug!("❌ [服务端] TLS 握手失败 {}: {}", remote_addr, e);
                            }
                        },
                        None => serve_connection(stream, context).await,
                    }
                });
            }
            Err(e) => {
                warn!(
                    "⚠️ [服务端] 实例 {} 接受连接失败: {}",
                    context.instance_id, e
                );
            }
        }
    }
}

/// unix 域套接字接受循环
#[cfg(unix)]
async fn accept_unix(
    listener: tokio::net::UnixListener,
    acceptor: Option<TlsAcceptor>,
    context: Arc<ConnectionContext>,
) {
    info!(
        "🚀 [服务端] 实例 {} 开始监听 unix 套接字 (TLS: {})",
        context.instance_id,
        acceptor.is_some()
    );
    context.bus.publish(
        &context.instance_id,
        ServerEvent::Ready(ReadyEvent {
            instance_id: context.instance_id.clone(),
            local_addr: None,
        }),
    );

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let context = context.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_connection(tls_stream, context).await,
                            Err(e) => {
                                debug!("❌ [服务端] unix 套接字 TLS 握手失败: {}", e);
                            }
                        },
                        None => serve_connection(stream, context).await,
                    }
                });
            }
            Err(e) => {
                warn!(
                    "⚠️ [服务端] 实例 {} 接受 unix 连接失败: {}",
                    context.instance_id, e
                );
            }
        }
    }
}

/// 把单个连接交给 hyper 驱动（HTTP/1.1 与 HTTP/2 自动协商）
async fn serve_connection<S>(stream: S, context: Arc<ConnectionContext>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |request| {
        let context = context.clone();
        async move { handle_request(context, request).await }
    });

    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
    {
        // 客户端断开等正常结束也会走到这里，只记调试日志
        debug!("🔌 [服务端] 连接处理结束: {}", e);
    }
}

/// 单个请求的完整流水线：中间件管道 → 事件广播 → 等待分发器写回
async fn handle_request(
    context: Arc<ConnectionContext>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut inbound = InboundRequest::from_hyper(request);

    if let Err(e) = context.chain.run(&mut inbound).await {
        warn!(
            "🚫 [服务端] 实例 {} 中间件拒绝请求 {} {}: {}",
            context.instance_id, inbound.method, inbound.uri, e
        );
        // 中间件错误是实例级致命错误：终止整个实例的事件流
        context.registry.fail(&context.instance_id, e.to_string());
        return Ok(blank_response(StatusCode::INTERNAL_SERVER_ERROR));
    }

    let (slot, receiver) = ResponseSlot::channel();
    let event = RequestEvent::wrap(
        context.instance_id.clone(),
        inbound,
        slot,
        context.render.clone(),
    );
    debug!(
        "📥 [服务端] 实例 {} 收到请求: {} {}",
        context.instance_id, event.method, event.url
    );
    context
        .bus
        .publish(&context.instance_id, ServerEvent::Request(Arc::new(event)));

    match receiver.await {
        Ok(response) => Ok(response),
        Err(_) => {
            // 事件的所有引用都被释放且无人发送响应
            debug!(
                "📭 [服务端] 实例 {} 的请求事件无人响应",
                context.instance_id
            );
            Ok(blank_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn blank_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

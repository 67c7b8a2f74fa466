//! 动作通道模块
//!
//! 整个驱动只有一条双工通道：命令（创建/关闭/发送）流入，
//! 生命周期与请求事件流出。出站事件按 `(实例标识, 事件种类)` 二元组
//! 过滤订阅，底层是每实例一个的多消费者广播。
//!
//! 订阅不回放历史：订阅之前发出的事件不会重播。

pub(crate) mod dispatcher;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::stream;
use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::broadcast;

use crate::error::{FluxError, FluxResult};
use crate::server::config::CreateConfig;
use crate::server::http_request::RequestEvent;
use crate::server::response::SendAction;
use crate::utils::logger::{debug, warn};

/// 每实例广播通道容量
///
/// 原始通道语义是无界的；广播有界，容量取大值，
/// 落后的订阅者丢最旧事件并记录警告
const BUS_CAPACITY: usize = 1024;

/// 入站命令
///
/// 动作通道边界上一次性解码的标签联合，每个变体只携带自己相关的字段
#[derive(Debug)]
pub enum FluxCommand {
    /// 创建并启动一个服务器实例（副作用：打开网络监听器）
    Create(CreateConfig),
    /// 关闭指定标识的全部实例并终止其事件流
    Close { id: String },
    /// 执行一个发送动作
    Send(SendAction),
}

/// 事件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// 监听器绑定成功，每次成功绑定恰好发出一次
    Ready,
    /// 入站请求通过中间件管道后发出
    Request,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Request => "request",
        }
    }
}

/// 就绪事件
#[derive(Debug, Clone)]
pub struct ReadyEvent {
    /// 所属实例标识
    pub instance_id: String,
    /// 绑定到的本地地址；unix 套接字没有 TCP 地址时为 None
    pub local_addr: Option<std::net::SocketAddr>,
}

/// 出站事件
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// 标签 `ready`
    Ready(ReadyEvent),
    /// 标签 `request`
    Request(Arc<RequestEvent>),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Ready(_) => EventKind::Ready,
            ServerEvent::Request(_) => EventKind::Request,
        }
    }

    pub fn instance_id(&self) -> &str {
        match self {
            ServerEvent::Ready(ready) => &ready.instance_id,
            ServerEvent::Request(request) => &request.instance_id,
        }
    }
}

/// 总线内部事件
#[derive(Debug, Clone)]
enum BusEvent {
    /// 正常事件
    Event(ServerEvent),
    /// 中间件错误，实例级致命，终止事件流
    Failed(String),
    /// close 命令终止事件流
    Closed,
}

/// 实例事件流
///
/// 惰性、可多订阅的事件序列：随实例被关闭而正常结束，
/// 随中间件错误以一条错误项结束
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = FluxResult<ServerEvent>> + Send>>,
}

impl Stream for EventStream {
    type Item = FluxResult<ServerEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish()
    }
}

/// 事件总线
///
/// 以实例标识为键的广播扇出：发布侧是服务器实例，
/// 订阅侧通过 [`InstanceSelector`] 按事件种类过滤
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<BusEvent>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// 确保实例的广播通道存在（订阅先于创建、创建先于订阅均可）
    pub(crate) fn touch(&self, instance_id: &str) {
        let _ = self.sender(instance_id);
    }

    fn sender(&self, instance_id: &str) -> broadcast::Sender<BusEvent> {
        self.channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone()
    }

    /// 发布一个事件；实例已关闭时静默丢弃
    pub(crate) fn publish(&self, instance_id: &str, event: ServerEvent) {
        match self.channels.get(instance_id) {
            Some(sender) => {
                // 没有任何订阅者时 send 返回错误，事件按原始语义丢弃
                let _ = sender.send(BusEvent::Event(event));
            }
            None => {
                debug!("📭 [动作通道] 实例 {} 已关闭，事件被丢弃", instance_id);
            }
        }
    }

    /// 以中间件错误终止实例的事件流
    pub(crate) fn fail(&self, instance_id: &str, message: String) {
        if let Some((_, sender)) = self.channels.remove(instance_id) {
            let _ = sender.send(BusEvent::Failed(message));
        }
    }

    /// 以 close 命令终止实例的事件流
    pub(crate) fn close(&self, instance_id: &str) {
        if let Some((_, sender)) = self.channels.remove(instance_id) {
            let _ = sender.send(BusEvent::Closed);
        }
    }

    /// 订阅指定实例、指定种类的事件序列
    pub fn subscribe(&self, instance_id: &str, kind: EventKind) -> EventStream {
        // 立即挂上接收端，避免订阅点之后的事件丢失
        let mut receiver = self.sender(instance_id).subscribe();
        let instance_id = instance_id.to_string();
        let inner = stream! {
            loop {
                match receiver.recv().await {
                    Ok(BusEvent::Event(event)) => {
                        if event.kind() == kind {
                            yield Ok(event);
                        }
                    }
                    Ok(BusEvent::Failed(message)) => {
                        yield Err(FluxError::MiddlewareError(message));
                        break;
                    }
                    Ok(BusEvent::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "⚠️ [动作通道] 实例 {} 的订阅者落后，丢弃 {} 条事件",
                            instance_id, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        EventStream {
            inner: Box::pin(inner),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("instances", &self.channels.len())
            .finish()
    }
}

/// 实例选择器
///
/// `select(id).events(kind)` 选择接口的前半部分
#[derive(Debug, Clone)]
pub struct InstanceSelector {
    bus: Arc<EventBus>,
    instance_id: String,
}

impl InstanceSelector {
    pub(crate) fn new(bus: Arc<EventBus>, instance_id: impl Into<String>) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
        }
    }

    /// 订阅指定种类的事件序列
    pub fn events(&self, kind: EventKind) -> EventStream {
        self.bus.subscribe(&self.instance_id, kind)
    }
}

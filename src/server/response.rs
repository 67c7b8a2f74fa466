//! 响应构建模块
//!
//! `ResponseBuilder` 是绑定到单个待定响应的纯工厂：所有方法只产出不可变的
//! [`SendAction`] 描述符，绝不直接写套接字。真正的写入由分发器统一执行。

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::FluxResult;

/// 模板渲染函数类型（配置期注入，仅被 `render` 意图使用）
pub type RenderFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// 待定响应槽
///
/// 每个入站请求对应一个槽，持有向 hyper 服务回送响应的一次性发送端。
/// 槽可以随事件被多个订阅者共享，但发送端只能被取出一次。
pub struct ResponseSlot {
    sender: Mutex<Option<oneshot::Sender<Response<Full<Bytes>>>>>,
}

impl ResponseSlot {
    /// 创建响应槽，返回槽与等待响应的接收端
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<Response<Full<Bytes>>>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
        });
        (slot, rx)
    }

    /// 取出发送端；第二次取出返回 None
    pub(crate) fn take(&self) -> Option<oneshot::Sender<Response<Full<Bytes>>>> {
        match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl std::fmt::Debug for ResponseSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let consumed = self
            .sender
            .lock()
            .map(|g| g.is_none())
            .unwrap_or(true);
        f.debug_struct("ResponseSlot")
            .field("consumed", &consumed)
            .finish()
    }
}

/// 发送选项
///
/// 各字段默认值：`status_code` 200（`redirect` 为 302）、`status_message` 空、
/// `headers` 空。显式提供的头在键完全相同（区分大小写）时覆盖默认头。
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// 状态码，未设置时使用各方法的默认值
    pub status_code: Option<u16>,
    /// 状态消息，未设置时为空
    pub status_message: Option<String>,
    /// 显式响应头
    pub headers: Vec<(String, String)>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// 模板渲染选项
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// 拼接在渲染结果之前的内容
    pub before_content: String,
    /// 拼接在渲染结果之后的内容
    pub after_content: String,
    /// 状态码，默认 200
    pub status_code: Option<u16>,
    /// 状态消息，默认空
    pub status_message: Option<String>,
    /// 显式响应头
    pub headers: Vec<(String, String)>,
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_content(mut self, content: impl Into<String>) -> Self {
        self.before_content = content.into();
        self
    }

    pub fn after_content(mut self, content: impl Into<String>) -> Self {
        self.after_content = content.into();
        self
    }

    pub fn status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn into_send_options(self) -> SendOptions {
        SendOptions {
            status_code: self.status_code,
            status_message: self.status_message,
            headers: self.headers,
        }
    }
}

/// 发送动作描述符
///
/// 不可变、一次性：由某个 `ResponseBuilder` 方法产出，由分发器消费一次。
/// 同一个响应槽收到多个发送动作属于未定义行为，后到者会被分发器丢弃。
#[derive(Debug, Clone)]
pub struct SendAction {
    /// 所属实例标识
    pub instance_id: String,
    /// 目标响应槽
    pub(crate) slot: Arc<ResponseSlot>,
    /// 响应体，None 表示无体响应（例如重定向）
    pub content: Option<Bytes>,
    /// 状态码
    pub status_code: u16,
    /// 状态消息（hyper 不支持自定义原因短语，仅记录日志）
    pub status_message: Option<String>,
    /// 响应头（保持插入顺序）
    pub headers: Vec<(String, String)>,
}

/// 响应构建器
///
/// 绑定到单个待定响应的无状态工厂，所有方法均为纯函数。
#[derive(Clone)]
pub struct ResponseBuilder {
    instance_id: String,
    slot: Arc<ResponseSlot>,
    render: RenderFn,
}

impl ResponseBuilder {
    /// 创建绑定到指定响应槽的构建器
    pub fn new(instance_id: impl Into<String>, slot: Arc<ResponseSlot>, render: RenderFn) -> Self {
        Self {
            instance_id: instance_id.into(),
            slot,
            render,
        }
    }

    /// 基础发送原语
    pub fn send(&self, content: impl Into<Bytes>, options: SendOptions) -> SendAction {
        self.action(Some(content.into()), Vec::new(), options, 200)
    }

    /// JSON 响应：序列化内容并设置 `Content-Type: application/json`
    pub fn json<T: Serialize + ?Sized>(
        &self,
        content: &T,
        options: SendOptions,
    ) -> FluxResult<SendAction> {
        let text = serde_json::to_string(content)?;
        Ok(self.action(
            Some(Bytes::from(text)),
            vec![("Content-Type".to_string(), "application/json".to_string())],
            options,
            200,
        ))
    }

    /// HTML 响应：设置 `Content-Type: text/html`
    pub fn html(&self, content: impl Into<String>, options: SendOptions) -> SendAction {
        self.action(
            Some(Bytes::from(content.into())),
            vec![("Content-Type".to_string(), "text/html".to_string())],
            options,
            200,
        )
    }

    /// 纯文本响应：设置 `Content-Type: text/plain`
    pub fn text(&self, content: impl Into<String>, options: SendOptions) -> SendAction {
        self.action(
            Some(Bytes::from(content.into())),
            vec![("Content-Type".to_string(), "text/plain".to_string())],
            options,
            200,
        )
    }

    /// 模板渲染响应
    ///
    /// 对内容应用注入的渲染函数，按 `before + 渲染结果 + after` 拼接，
    /// 设置 `Content-Type: text/html`
    pub fn render(&self, content: &str, options: RenderOptions) -> SendAction {
        let rendered = (self.render)(content);
        let body = format!("{}{}{}", options.before_content, rendered, options.after_content);
        self.action(
            Some(Bytes::from(body)),
            vec![("Content-Type".to_string(), "text/html".to_string())],
            options.into_send_options(),
            200,
        )
    }

    /// 重定向响应：无响应体，默认 302，设置 `Location` 头
    pub fn redirect(&self, path: &str, options: SendOptions) -> SendAction {
        self.action(
            None,
            vec![("Location".to_string(), path.to_string())],
            options,
            302,
        )
    }

    fn action(
        &self,
        content: Option<Bytes>,
        default_headers: Vec<(String, String)>,
        options: SendOptions,
        default_status: u16,
    ) -> SendAction {
        SendAction {
            instance_id: self.instance_id.clone(),
            slot: self.slot.clone(),
            content,
            status_code: options.status_code.unwrap_or(default_status),
            status_message: options.status_message,
            headers: merge_headers(default_headers, options.headers),
        }
    }
}

impl std::fmt::Debug for ResponseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBuilder")
            .field("instance_id", &self.instance_id)
            .field("slot", &self.slot)
            .finish()
    }
}

/// 恒等渲染函数（未注入渲染函数时的默认值）
pub fn identity_render() -> RenderFn {
    Arc::new(|data: &str| data.to_string())
}

/// 合并默认头与显式头
///
/// 键完全相同时显式头覆盖默认头，其余显式头按原顺序追加。
/// 不做大小写归一化，只做精确键匹配。
fn merge_headers(
    defaults: Vec<(String, String)>,
    explicit: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let mut merged = defaults;
    for (name, value) in explicit {
        match merged.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => merged.push((name, value)),
        }
    }
    merged
}

//! RAT Flux - 基于动作流的响应式 HTTP 服务器驱动
//!
//! 把 HTTP 服务器的生命周期与请求/响应事件暴露为可组合的事件流：
//! 命令（创建实例/关闭实例/发送响应）流入一条动作通道，
//! 就绪与请求事件按 `(实例标识, 事件种类)` 过滤流出；
//! 请求处理只产出声明式的发送动作描述符，真实写入由分发器统一执行。
//!
//! ## 核心特性
//!
//! - 多实例复用：任意数量的服务器实例共享同一条动作通道
//! - 中间件管道：根中间件与实例中间件顺序拦截，错误即实例级终止
//! - 纯响应构建：`send`/`json`/`html`/`text`/`render`/`redirect`
//!   只产出不可变描述符，与响应投递完全解耦
//! - 传输委托：HTTP 解析交给 hyper，TLS 握手交给 rustls
//!
//! ## 快速开始
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use rat_flux::{CreateConfig, EventKind, FluxCommand, FluxEngine, ServerEvent};
//!
//! #[tokio::main]
//! async fn main() -> rat_flux::FluxResult<()> {
//!     let engine = FluxEngine::builder()
//!         .render(|data| format!("<p>{}</p>", data))
//!         .start();
//!
//!     // 先订阅，再创建（订阅不回放历史事件）
//!     let mut requests = engine.select("api").events(EventKind::Request);
//!     engine.create(CreateConfig::new("api").port(8080))?;
//!
//!     while let Some(event) = requests.next().await {
//!         if let ServerEvent::Request(request) = event? {
//!             let action = request.response.json(&serde_json::json!({"ok": true}), Default::default())?;
//!             engine.send(FluxCommand::Send(action))?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod engine;
pub mod error;
pub mod server;
pub mod utils;

pub use channel::{
    EventBus, EventKind, EventStream, FluxCommand, InstanceSelector, ReadyEvent, ServerEvent,
};
pub use engine::{FluxEngine, FluxEngineBuilder};
pub use error::{FluxError, FluxResult};
pub use server::cert_manager::CertManager;
pub use server::config::{CreateConfig, ListenTarget, TlsOptions};
pub use server::http_request::{InboundRequest, RequestEvent};
pub use server::middleware::{
    BodyReaderMiddleware, DynMiddleware, FnMiddleware, Middleware, MiddlewareChain,
};
pub use server::response::{
    RenderFn, RenderOptions, ResponseBuilder, ResponseSlot, SendAction, SendOptions,
    identity_render,
};
pub use server::router::{RouteMatch, Router};

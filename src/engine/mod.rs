//! RAT Flux 驱动入口模块
//!
//! `FluxEngine` 是唯一的配置与接入点：通过 builder 注入根中间件与
//! 渲染函数，`start()` 在 tokio 运行时上启动命令处理循环。
//! 之后命令经 [`send`](FluxEngine::send) 流入，事件经
//! [`select`](FluxEngine::select) 流出。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::dispatcher::Dispatcher;
use crate::channel::{EventBus, FluxCommand, InstanceSelector};
use crate::error::{FluxError, FluxResult};
use crate::server::ServerRegistry;
use crate::server::config::CreateConfig;
use crate::server::middleware::DynMiddleware;
use crate::server::response::{RenderFn, identity_render};
use crate::utils::logger::debug;

/// 驱动构建器（唯一的配置入口点）
pub struct FluxEngineBuilder {
    root_middlewares: Vec<DynMiddleware>,
    render: Option<RenderFn>,
}

impl FluxEngineBuilder {
    pub fn new() -> Self {
        Self {
            root_middlewares: Vec::new(),
            render: None,
        }
    }

    /// 追加一个根中间件（全部实例共享，执行顺序排在实例中间件之前）
    pub fn middleware(mut self, middleware: DynMiddleware) -> Self {
        self.root_middlewares.push(middleware);
        self
    }

    /// 注入模板渲染函数，未注入时使用恒等函数
    pub fn render<F>(mut self, render: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.render = Some(Arc::new(render));
        self
    }

    /// 启动命令处理循环并返回驱动句柄
    ///
    /// 必须在 tokio 运行时内调用
    pub fn start(self) -> FluxEngine {
        let bus = Arc::new(EventBus::new());
        let render = self.render.unwrap_or_else(identity_render);
        let registry = Arc::new(ServerRegistry::new(
            bus.clone(),
            self.root_middlewares,
            render,
        ));
        let (commands, receiver) = mpsc::unbounded_channel();
        let command_loop = tokio::spawn(run_command_loop(receiver, registry.clone()));

        FluxEngine {
            commands,
            bus,
            registry,
            command_loop,
        }
    }
}

impl Default for FluxEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 命令处理循环：把三类命令分派给注册表与分发器
///
/// 命令在这里被顺序消费，发送动作的执行天然串行化
async fn run_command_loop(
    mut receiver: mpsc::UnboundedReceiver<FluxCommand>,
    registry: Arc<ServerRegistry>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            FluxCommand::Create(config) => registry.clone().create(config),
            FluxCommand::Close { id } => registry.close(&id),
            FluxCommand::Send(action) => Dispatcher::dispatch(action),
        }
    }
    debug!("🛑 [驱动] 命令循环退出");
}

/// RAT Flux 驱动句柄
///
/// 命令入口与事件选择接口的组合。句柄被丢弃不会停止驱动，
/// 需要显式调用 [`shutdown`](Self::shutdown)。
pub struct FluxEngine {
    commands: mpsc::UnboundedSender<FluxCommand>,
    bus: Arc<EventBus>,
    registry: Arc<ServerRegistry>,
    command_loop: JoinHandle<()>,
}

impl FluxEngine {
    /// 创建驱动构建器
    pub fn builder() -> FluxEngineBuilder {
        FluxEngineBuilder::new()
    }

    /// 向动作通道发送一条命令
    pub fn send(&self, command: FluxCommand) -> FluxResult<()> {
        self.commands
            .send(command)
            .map_err(|_| FluxError::ChannelError("命令循环已停止".to_string()))
    }

    /// 发送 create 命令的便捷方法
    pub fn create(&self, config: CreateConfig) -> FluxResult<()> {
        self.send(FluxCommand::Create(config))
    }

    /// 发送 close 命令的便捷方法
    pub fn close(&self, id: impl Into<String>) -> FluxResult<()> {
        self.send(FluxCommand::Close { id: id.into() })
    }

    /// 选择某个实例的事件
    ///
    /// 订阅不回放历史事件，应当在发出 create 命令之前完成订阅
    pub fn select(&self, instance_id: &str) -> InstanceSelector {
        InstanceSelector::new(self.bus.clone(), instance_id)
    }

    /// 停止全部实例与命令循环
    pub fn shutdown(&self) {
        self.registry.shutdown_all();
        self.command_loop.abort();
    }
}

impl std::fmt::Debug for FluxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluxEngine")
            .field("registry", &self.registry)
            .finish()
    }
}

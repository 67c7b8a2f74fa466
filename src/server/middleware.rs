//! 中间件管道模块
//!
//! 每个入站请求在成为事件之前，先顺序通过一条拦截器链：
//! 根中间件（全部实例共享）按数组顺序在前，实例中间件按数组顺序在后。
//! 拦截器返回 `Ok(())` 继续，返回错误则短路剩余拦截器并使管道整体失败。
//! 管道不设置任何超时，悬住的拦截器会让对应请求无限期挂起。

use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::BodyExt;

use crate::error::{FluxError, FluxResult};
use crate::server::http_request::InboundRequest;

/// 中间件（拦截器）
///
/// 拦截器可以就地修改请求（例如取走请求体流并填充 `body`），
/// 链上靠后的拦截器与最终的请求包装都会看到这些修改。
#[async_trait]
pub trait Middleware: Send + Sync {
    /// 处理请求；返回错误即拒绝请求并终止所属实例的事件流
    async fn handle(&self, request: &mut InboundRequest) -> FluxResult<()>;
}

/// 动态中间件引用
pub type DynMiddleware = Arc<dyn Middleware>;

/// 同步函数中间件适配器
///
/// 将普通闭包适配为中间件，适合无需等待的就地修改或校验
pub struct FnMiddleware<F>
where
    F: Fn(&mut InboundRequest) -> FluxResult<()> + Send + Sync,
{
    func: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(&mut InboundRequest) -> FluxResult<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut InboundRequest) -> FluxResult<()> + Send + Sync,
{
    async fn handle(&self, request: &mut InboundRequest) -> FluxResult<()> {
        (self.func)(request)
    }
}

/// 读体中间件
///
/// 参考实现的请求体协作者：取走原始请求体流，读完后填充 `body` 字段。
/// 未配置本中间件时事件的 `body` 保持 None。
#[derive(Debug, Default)]
pub struct BodyReaderMiddleware;

impl BodyReaderMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for BodyReaderMiddleware {
    async fn handle(&self, request: &mut InboundRequest) -> FluxResult<()> {
        if let Some(payload) = request.payload.take() {
            let collected = payload
                .collect()
                .await
                .map_err(|e| FluxError::RequestError(format!("读取请求体失败: {}", e)))?;
            request.body = Some(collected.to_bytes());
        }
        Ok(())
    }
}

/// 中间件链
///
/// 根中间件在前、实例中间件在后的有序拦截器序列，由驱动循环顺序执行
pub struct MiddlewareChain {
    stages: Vec<DynMiddleware>,
}

impl MiddlewareChain {
    /// 按执行顺序拼接根中间件与实例中间件
    pub fn new(root: &[DynMiddleware], instance: &[DynMiddleware]) -> Self {
        let mut stages = Vec::with_capacity(root.len() + instance.len());
        stages.extend(root.iter().cloned());
        stages.extend(instance.iter().cloned());
        Self { stages }
    }

    /// 链上拦截器数量
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 顺序执行整条链；第一个错误短路剩余拦截器
    pub async fn run(&self, request: &mut InboundRequest) -> FluxResult<()> {
        for stage in &self.stages {
            stage.handle(request).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

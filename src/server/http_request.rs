//! 请求包装模块
//!
//! 将 hyper 的原始请求归一化为稳定的事件记录，并附带绑定到本次响应的
//! [`ResponseBuilder`]。包装本身是纯转换，不做任何 I/O。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::http::{HeaderMap, Method, Request, Uri};
use serde::de::DeserializeOwned;

use crate::error::{FluxError, FluxResult};
use crate::server::response::{RenderFn, ResponseBuilder, ResponseSlot};

/// 归一化的入站请求
///
/// 中间件管道操作的对象：中间件可以就地修改它（典型场景是读体中间件
/// 取走 `payload` 并填充 `body`），后续中间件与请求包装都能看到修改。
pub struct InboundRequest {
    /// 请求方法
    pub method: Method,
    /// 请求 URI
    pub uri: Uri,
    /// 请求头
    pub headers: HeaderMap,
    /// 原始请求体流，由读体中间件取走
    pub payload: Option<Incoming>,
    /// 已读取的请求体，由外部读体中间件填充；未填充时保持 None
    pub body: Option<Bytes>,
}

impl InboundRequest {
    /// 从 hyper 请求构造
    pub fn from_hyper(request: Request<Incoming>) -> Self {
        let (parts, payload) = request.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            payload: Some(payload),
            body: None,
        }
    }

    /// 按名称读取请求头文本值
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("body_len", &self.body.as_ref().map(|b| b.len()))
            .finish()
    }
}

/// 请求事件
///
/// 事件标签为 `request`，随实例事件流广播给所有订阅者。原始请求体流
/// 归传输层所有、不会被复制，通过 [`take_payload`](Self::take_payload)
/// 至多取出一次。
pub struct RequestEvent {
    /// 所属实例标识
    pub instance_id: String,
    /// 完整请求 URL 文本
    pub url: String,
    /// 请求方法
    pub method: Method,
    /// 请求头
    pub headers: HeaderMap,
    /// 请求体，由读体中间件填充；没有读体中间件时为 None
    pub body: Option<Bytes>,
    /// 绑定到本次待定响应的构建器
    pub response: ResponseBuilder,
    payload: Mutex<Option<Incoming>>,
}

impl RequestEvent {
    /// 包装归一化请求为事件记录（纯转换）
    pub fn wrap(
        instance_id: impl Into<String>,
        request: InboundRequest,
        slot: Arc<ResponseSlot>,
        render: RenderFn,
    ) -> Self {
        let instance_id = instance_id.into();
        Self {
            url: request.uri.to_string(),
            method: request.method,
            headers: request.headers,
            body: request.body,
            response: ResponseBuilder::new(instance_id.clone(), slot, render),
            payload: Mutex::new(request.payload),
            instance_id,
        }
    }

    /// 请求路径（不含查询串）
    pub fn path(&self) -> &str {
        match self.url.split_once('?') {
            Some((path, _)) => path,
            None => &self.url,
        }
    }

    /// 解析查询参数
    ///
    /// 键值做百分号解码，解码失败的片段保留原文
    pub fn query_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        let Some((_, query)) = self.url.split_once('?') else {
            return params;
        };
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = urlencoding::decode(name)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| name.to_string());
            let value = urlencoding::decode(value)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| value.to_string());
            params.insert(name, value);
        }
        params
    }

    /// 按名称读取请求头文本值
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// 将请求体反序列化为 JSON
    ///
    /// 需要读体中间件已填充 `body`，否则返回请求错误
    pub fn json_body<T: DeserializeOwned>(&self) -> FluxResult<T> {
        let body = self
            .body
            .as_ref()
            .ok_or_else(|| FluxError::RequestError("请求体未读取，请配置读体中间件".to_string()))?;
        Ok(serde_json::from_slice(body)?)
    }

    /// 取出原始请求体流；第二次调用返回 None
    pub fn take_payload(&self) -> Option<Incoming> {
        match self.payload.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl std::fmt::Debug for RequestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEvent")
            .field("instance_id", &self.instance_id)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("body_len", &self.body.as_ref().map(|b| b.len()))
            .finish()
    }
}

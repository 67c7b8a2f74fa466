//! 分发器模块
//!
//! 唯一被允许执行真实响应写入的组件：消费所有 `send` 命令，
//! 对每个响应槽恰好写一次（状态码、响应头、响应体）。
//! 纯发后不理：任何失败只记日志，不向动作通道回报。

use bytes::Bytes;
use http_body_util::Full;
use hyper::http::{HeaderName, HeaderValue, StatusCode};
use hyper::Response;

use crate::server::response::SendAction;
use crate::utils::logger::{debug, warn};

/// 发送动作分发器
pub(crate) struct Dispatcher;

impl Dispatcher {
    /// 执行一个发送动作
    ///
    /// 槽已被消费（重复发送）或连接已断开时静默丢弃
    pub(crate) fn dispatch(action: SendAction) {
        let Some(sender) = action.slot.take() else {
            debug!(
                "📭 [分发器] 实例 {} 的响应槽已被消费，重复的发送动作被丢弃",
                action.instance_id
            );
            return;
        };

        if let Some(message) = &action.status_message {
            // hyper 不支持自定义原因短语，状态消息只记录不落线
            debug!(
                "📝 [分发器] 状态消息不写入响应: {} {}",
                action.status_code, message
            );
        }

        let response = build_response(&action);
        if sender.send(response).is_err() {
            debug!(
                "🔌 [分发器] 实例 {} 的连接已断开，响应被丢弃",
                action.instance_id
            );
        }
    }
}

/// 把发送动作描述符转换为 hyper 响应
fn build_response(action: &SendAction) -> Response<Full<Bytes>> {
    let body = action.content.clone().unwrap_or_else(Bytes::new);
    let mut response = Response::new(Full::new(body));

    *response.status_mut() = match StatusCode::from_u16(action.status_code) {
        Ok(status) => status,
        Err(_) => {
            warn!(
                "⚠️ [分发器] 非法状态码 {}，回退为 200",
                action.status_code
            );
            StatusCode::OK
        }
    };

    let headers = response.headers_mut();
    for (name, value) in &action.headers {
        let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
            warn!("⚠️ [分发器] 非法响应头名被丢弃: {}", name);
            continue;
        };
        let Ok(header_value) = HeaderValue::try_from(value.as_str()) else {
            warn!("⚠️ [分发器] 非法响应头值被丢弃: {}: {}", name, value);
            continue;
        };
        headers.append(header_name, header_value);
    }

    response
}

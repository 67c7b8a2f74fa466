//! RAT Flux 错误处理模块
//!
//! 提供驱动内部统一的错误类型与结果别名

use thiserror::Error;

/// RAT Flux 统一错误类型
#[derive(Error, Debug)]
pub enum FluxError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    NetworkError(String),

    /// 监听器绑定失败
    #[error("绑定失败: {0}")]
    BindError(#[from] std::io::Error),

    /// TLS 错误
    #[error("TLS 错误: {0}")]
    TlsError(String),

    /// 证书错误
    #[error("证书错误: {0}")]
    CertificateError(String),

    /// 中间件拒绝请求（实例级致命错误）
    #[error("中间件错误: {0}")]
    MiddlewareError(String),

    /// 请求错误
    #[error("请求错误: {0}")]
    RequestError(String),

    /// 动作通道已关闭
    #[error("通道错误: {0}")]
    ChannelError(String),

    /// JSON 序列化/反序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// RAT Flux 统一结果类型
pub type FluxResult<T> = Result<T, FluxError>;

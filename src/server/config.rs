//! 服务器实例配置模块
//!
//! `create` 命令携带的全部配置：实例标识、监听目标、安全配置与实例中间件。
//! 各字段都有默认值，监听目标按严格优先级一次性解析。

use std::path::PathBuf;

use crate::error::FluxResult;
use crate::server::middleware::DynMiddleware;

/// 未指定主机名时的默认绑定地址（与 Node 的 listen 行为一致，绑定所有接口）
pub const DEFAULT_HOSTNAME: &str = "0.0.0.0";

/// 未指定 backlog 时传给内核的默认值
pub const DEFAULT_BACKLOG: u32 = 1024;

/// TLS 安全配置
///
/// `create` 命令的 `secured` 配置：存在即启用 TLS，缺席即明文。
/// 证书来源二选一：PEM 文件路径，或开发模式自动生成自签名证书。
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM 证书链路径
    pub cert_path: Option<PathBuf>,
    /// PEM 私钥路径
    pub key_path: Option<PathBuf>,
    /// 开发模式：自动生成自签名证书，忽略路径配置
    pub development_mode: bool,
    /// 开发模式自签名证书的主机名列表
    pub hostnames: Vec<String>,
}

impl TlsOptions {
    /// 使用 PEM 证书文件
    pub fn from_pem(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
            development_mode: false,
            hostnames: Vec::new(),
        }
    }

    /// 开发模式：运行时生成自签名证书
    pub fn development(hostnames: Vec<String>) -> Self {
        Self {
            cert_path: None,
            key_path: None,
            development_mode: true,
            hostnames,
        }
    }
}

/// 解析后的监听目标
///
/// 优先级固定为：预打开句柄 > unix 套接字路径 > TCP 三元组
pub enum ListenTarget {
    /// 预打开的标准库监听器
    Handle(std::net::TcpListener),
    /// unix 域套接字路径
    #[cfg(unix)]
    Path(PathBuf),
    /// TCP 端口绑定；port 为 0 时由内核分配临时端口
    Tcp {
        port: u16,
        hostname: String,
        backlog: u32,
    },
}

impl std::fmt::Debug for ListenTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenTarget::Handle(listener) => f
                .debug_tuple("Handle")
                .field(&listener.local_addr().ok())
                .finish(),
            #[cfg(unix)]
            ListenTarget::Path(path) => f.debug_tuple("Path").field(path).finish(),
            ListenTarget::Tcp {
                port,
                hostname,
                backlog,
            } => f
                .debug_struct("Tcp")
                .field("port", port)
                .field("hostname", hostname)
                .field("backlog", backlog)
                .finish(),
        }
    }
}

/// 服务器实例创建配置
///
/// 标识由调用方提供，仅作为路由键使用，驱动不保证唯一：
/// 相同标识的重复 `create` 会并行启动互不合并的监听器。
pub struct CreateConfig {
    /// 实例标识
    pub id: String,
    /// TLS 配置，None 表示明文
    pub secured: Option<TlsOptions>,
    /// 监听端口
    pub port: Option<u16>,
    /// 绑定主机名
    pub hostname: Option<String>,
    /// 内核 backlog
    pub backlog: Option<u32>,
    /// 预打开的监听器句柄（最高优先级）
    pub handle: Option<std::net::TcpListener>,
    /// unix 套接字路径（次优先级）
    pub path: Option<PathBuf>,
    /// 实例中间件，执行顺序排在根中间件之后
    pub middlewares: Vec<DynMiddleware>,
}

impl CreateConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secured: None,
            port: None,
            hostname: None,
            backlog: None,
            handle: None,
            path: None,
            middlewares: Vec::new(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn handle(mut self, listener: std::net::TcpListener) -> Self {
        self.handle = Some(listener);
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn secured(mut self, options: TlsOptions) -> Self {
        self.secured = Some(options);
        self
    }

    pub fn middleware(mut self, middleware: DynMiddleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// 按严格优先级解析监听目标：句柄 > unix 路径 > TCP 三元组
    ///
    /// TCP 三元组的缺省值：端口 0（临时端口）、主机名 `0.0.0.0`、
    /// backlog [`DEFAULT_BACKLOG`]
    pub(crate) fn take_listen_target(&mut self) -> FluxResult<ListenTarget> {
        if let Some(handle) = self.handle.take() {
            return Ok(ListenTarget::Handle(handle));
        }
        if let Some(path) = self.path.take() {
            #[cfg(unix)]
            return Ok(ListenTarget::Path(path));
            #[cfg(not(unix))]
            return Err(crate::error::FluxError::ConfigError(format!(
                "当前平台不支持 unix 套接字路径: {}",
                path.display()
            )));
        }
        Ok(ListenTarget::Tcp {
            port: self.port.unwrap_or(0),
            hostname: self
                .hostname
                .take()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            backlog: self.backlog.unwrap_or(DEFAULT_BACKLOG),
        })
    }
}

impl std::fmt::Debug for CreateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateConfig")
            .field("id", &self.id)
            .field("secured", &self.secured.is_some())
            .field("port", &self.port)
            .field("hostname", &self.hostname)
            .field("backlog", &self.backlog)
            .field("handle", &self.handle.is_some())
            .field("path", &self.path)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_takes_precedence() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("测试绑定失败");
        let mut config = CreateConfig::new("a")
            .handle(listener)
            .path("/tmp/never-used.sock")
            .port(8080);
        assert!(matches!(
            config.take_listen_target().unwrap(),
            ListenTarget::Handle(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_path_takes_precedence_over_port() {
        let mut config = CreateConfig::new("a").path("/tmp/flux.sock").port(8080);
        assert!(matches!(
            config.take_listen_target().unwrap(),
            ListenTarget::Path(_)
        ));
    }

    #[test]
    fn test_tcp_defaults() {
        let mut config = CreateConfig::new("a");
        match config.take_listen_target().unwrap() {
            ListenTarget::Tcp {
                port,
                hostname,
                backlog,
            } => {
                assert_eq!(port, 0);
                assert_eq!(hostname, DEFAULT_HOSTNAME);
                assert_eq!(backlog, DEFAULT_BACKLOG);
            }
            other => panic!("期望 TCP 监听目标，得到 {:?}", other),
        }
    }

    #[test]
    fn test_empty_hostname_falls_back() {
        let mut config = CreateConfig::new("a").hostname("").port(9000);
        match config.take_listen_target().unwrap() {
            ListenTarget::Tcp { hostname, port, .. } => {
                assert_eq!(hostname, DEFAULT_HOSTNAME);
                assert_eq!(port, 9000);
            }
            other => panic!("期望 TCP 监听目标，得到 {:?}", other),
        }
    }
}

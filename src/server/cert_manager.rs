//! 证书管理模块
//!
//! 将 `secured` 配置转换为 rustls 接受器：
//! 生产路径从 PEM 文件加载证书链与私钥，开发模式运行时生成自签名证书。

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig as RustlsServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::{FluxError, FluxResult};
use crate::server::config::TlsOptions;
use crate::utils::crypto_provider::ensure_crypto_provider_installed;
use crate::utils::logger::{debug, info};

/// 证书管理器
///
/// 无状态：每次构建接受器时按配置重新解析证书材料
pub struct CertManager {
    options: TlsOptions,
}

impl CertManager {
    pub fn new(options: TlsOptions) -> Self {
        Self { options }
    }

    /// 构建 TLS 接受器
    ///
    /// 开发模式生成自签名证书，否则从配置的 PEM 路径加载。
    /// ALPN 同时声明 h2 与 http/1.1，由连接协商决定。
    pub fn build_acceptor(&self) -> FluxResult<TlsAcceptor> {
        ensure_crypto_provider_installed();

        let (certs, key) = if self.options.development_mode {
            self.generate_self_signed()?
        } else {
            self.load_pem()?
        };

        let mut config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| FluxError::TlsError(format!("TLS 配置构建失败: {}", e)))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// 从 PEM 文件加载证书链与私钥
    fn load_pem(&self) -> FluxResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_path = self
            .options
            .cert_path
            .as_deref()
            .ok_or_else(|| FluxError::CertificateError("未配置证书路径".to_string()))?;
        let key_path = self
            .options
            .key_path
            .as_deref()
            .ok_or_else(|| FluxError::CertificateError("未配置私钥路径".to_string()))?;

        let certs = read_certs(cert_path)?;
        if certs.is_empty() {
            return Err(FluxError::CertificateError(format!(
                "证书文件中没有证书: {}",
                cert_path.display()
            )));
        }

        let mut key_reader = BufReader::new(open_pem(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| FluxError::CertificateError(format!("读取私钥失败: {}", e)))?
            .ok_or_else(|| {
                FluxError::CertificateError(format!(
                    "私钥文件中没有私钥: {}",
                    key_path.display()
                ))
            })?;

        info!("🔐 [证书管理] 已加载证书: {}", cert_path.display());
        Ok((certs, key))
    }

    /// 开发模式：生成自签名证书
    fn generate_self_signed(
        &self,
    ) -> FluxResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let hostnames = if self.options.hostnames.is_empty() {
            vec!["localhost".to_string(), "127.0.0.1".to_string()]
        } else {
            self.options.hostnames.clone()
        };

        debug!("🔧 [证书管理] 开发模式生成自签名证书: {:?}", hostnames);

        let cert = rcgen::generate_simple_self_signed(hostnames)
            .map_err(|e| FluxError::CertificateError(format!("生成自签名证书失败: {}", e)))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|e| FluxError::CertificateError(format!("序列化自签名证书失败: {}", e)))?;
        let key_der = cert.serialize_private_key_der();

        Ok((
            vec![CertificateDer::from(cert_der)],
            PrivateKeyDer::Pkcs8(key_der.into()),
        ))
    }
}

fn open_pem(path: &Path) -> FluxResult<File> {
    File::open(path).map_err(|e| {
        FluxError::CertificateError(format!("打开 PEM 文件失败 {}: {}", path.display(), e))
    })
}

fn read_certs(path: &Path) -> FluxResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(open_pem(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FluxError::CertificateError(format!("解析证书失败: {}", e)))
}

use std::sync::Once;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// 确保 rustls 加密提供者初始化只执行一次
///
/// 这个函数使用 std::sync::Once 确保无论被调用多少次，
/// ring 提供者的安装只会执行一次
pub fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // 已有进程级提供者时安装会失败，忽略即可
        let _ = rustls::crypto::ring::default_provider().install_default();
        crate::utils::logger::debug!("🔐 rustls ring 加密提供者已初始化");
    });
}

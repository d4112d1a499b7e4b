use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use keel_core::error::CoreError;

use crate::error::{EngineError, config_error};

/// 服务端会话配置：证书链 + 私钥，装配一次、所有会话共享。
#[derive(Clone)]
pub struct TlsServerConfig {
    pub(crate) inner: Arc<rustls::ServerConfig>,
}

impl TlsServerConfig {
    /// 从 PEM 文本装配：`cert_pem` 为证书链，`key_pem` 为私钥。
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CoreError> {
        let certs = parse_certs(cert_pem)?;
        let key = parse_key(key_pem)?;
        let config = base_server_builder()?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| config_error("certificate chain rejected").with_cause(EngineError::classify(&err)))?;
        Ok(Self {
            inner: Arc::new(config),
        })
    }
}

/// 客户端会话配置：信任锚集合。
#[derive(Clone)]
pub struct TlsClientConfig {
    pub(crate) inner: Arc<rustls::ClientConfig>,
}

impl TlsClientConfig {
    /// 以 PEM 文本中的证书为信任锚装配；自签部署与测试场景由此注入根。
    pub fn from_root_pem(root_pem: &[u8]) -> Result<Self, CoreError> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in parse_certs(root_pem)? {
            roots
                .add(cert)
                .map_err(|err| config_error("trust anchor rejected").with_cause(EngineError::classify(&err)))?;
        }
        Self::from_roots(roots)
    }

    /// 直接使用调用方装配好的信任锚集合。
    pub fn from_roots(roots: rustls::RootCertStore) -> Result<Self, CoreError> {
        let config = base_client_builder()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            inner: Arc::new(config),
        })
    }
}

// rustls 默认构建器依赖进程级 provider 安装；这里显式固定 ring，
// 避免二进制里另有 provider 时产生歧义。
fn base_server_builder()
-> Result<rustls::ConfigBuilder<rustls::ServerConfig, rustls::WantsVerifier>, CoreError> {
    rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|err| config_error("protocol versions rejected").with_cause(EngineError::classify(&err)))
}

fn base_client_builder()
-> Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::WantsVerifier>, CoreError> {
    rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|err| config_error("protocol versions rejected").with_cause(EngineError::classify(&err)))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CoreError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| config_error("certificate pem is malformed").with_cause(err))?;
    if certs.is_empty() {
        return Err(config_error("certificate pem contains no certificate"));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, CoreError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|err| config_error("private key pem is malformed").with_cause(err))?
        .ok_or_else(|| config_error("private key pem contains no key"))
}

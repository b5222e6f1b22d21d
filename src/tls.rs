/// rustls 客户端配置装配
///
/// 源站握手与代理侧 TLS 共用同一套装配逻辑：信任根来自调用方指定的
/// CA 文件，否则回退到系统证书。skip_verify 只跳过证书链校验，握手
/// 签名仍按默认 provider 支持的算法验证，供测试环境对自签名端点握手
use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// 构建客户端 TLS 配置
pub fn load_client_config(
    ca_cert_path: Option<&Path>,
    skip_verify: bool,
) -> Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder();

    let config = if skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ChainSkipVerifier::new()))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(trust_roots(ca_cert_path)?)
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// 组装信任根：优先调用方指定的 CA 文件，否则回退到系统证书
fn trust_roots(ca_cert_path: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match ca_cert_path {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read CA bundle {:?}", path))?;
            let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("Failed to parse CA bundle {:?}", path))?;

            let (added, rejected) = roots.add_parsable_certificates(certs);
            if added == 0 {
                anyhow::bail!(
                    "No usable CA certificates in {:?} ({} rejected)",
                    path,
                    rejected
                );
            }
        }
        None => {
            // 系统证书缺失不视为错误：请求方可以自带配置或走 skip_verify
            let loaded = rustls_native_certs::load_native_certs();
            let (added, _) = roots.add_parsable_certificates(loaded.certs);
            if added == 0 {
                warn!("No usable system root certificates found");
            }
        }
    }

    Ok(roots)
}

/// 跳过证书链校验的验证器
///
/// 证书链直接放行，握手签名仍交给默认 provider 的算法验证
#[derive(Debug)]
struct ChainSkipVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ChainSkipVerifier {
    fn new() -> Self {
        let algorithms = match CryptoProvider::get_default() {
            Some(provider) => provider.signature_verification_algorithms,
            None => rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        };
        Self { algorithms }
    }
}

impl ServerCertVerifier for ChainSkipVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_verify_config_builds() {
        let config = load_client_config(None, true).unwrap();
        // 链校验跳过时不需要信任根
        assert!(!config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_missing_ca_bundle_is_an_error() {
        let err = load_client_config(Some(Path::new("/nonexistent/ca.pem")), false).unwrap_err();
        assert!(err.to_string().contains("Failed to read CA bundle"));
    }

    #[test]
    fn test_junk_ca_bundle_is_an_error() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("tunnel-agent-junk-ca-{}.pem", std::process::id()));
        std::fs::write(&path, b"this is not a certificate").unwrap();

        let err = trust_roots(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("No usable CA certificates"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_ca_bundle_roundtrip() {
        let generated =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir();
        let path = dir.join(format!("tunnel-agent-test-ca-{}.pem", std::process::id()));
        std::fs::write(&path, generated.cert.pem()).unwrap();

        let roots = trust_roots(Some(&path)).unwrap();
        assert_eq!(roots.len(), 1);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_chain_skip_verifier_reports_schemes() {
        let verifier = ChainSkipVerifier::new();
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}

use reqwest::Proxy;

use crate::DownloadError;

/// Proxy protocol
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Infer the proxy type from the URL scheme, defaulting to HTTP.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let proxy_type = match url.split_once("://").map(|(scheme, _)| scheme) {
            Some("socks5") | Some("socks5h") => ProxyType::Socks5,
            Some("https") => ProxyType::Https,
            _ => ProxyType::Http,
        };
        Self {
            url,
            proxy_type,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// Build a reqwest Proxy from the configuration.
///
/// Every scheme is routed through the proxy; the type only decides how the proxy
/// itself is reached.
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let proxy_url = &config.url;

    let url = match config.proxy_type {
        ProxyType::Http | ProxyType::Https => proxy_url.to_string(),
        ProxyType::Socks5 => {
            if proxy_url.starts_with("socks5://") || proxy_url.starts_with("socks5h://") {
                proxy_url.to_string()
            } else {
                format!("socks5://{proxy_url}")
            }
        }
    };

    let mut proxy = Proxy::all(&url).map_err(|e| DownloadError::ProxyConfiguration {
        reason: format!("invalid {:?} proxy URL `{url}`: {e}", config.proxy_type),
    })?;

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_from_url() {
        assert_eq!(
            ProxyConfig::from_url("socks5://127.0.0.1:1080").proxy_type,
            ProxyType::Socks5
        );
        assert_eq!(
            ProxyConfig::from_url("https://proxy:443").proxy_type,
            ProxyType::Https
        );
        assert_eq!(
            ProxyConfig::from_url("proxy.local:8080").proxy_type,
            ProxyType::Http
        );
    }

    #[test]
    fn test_socks_scheme_is_added() {
        let config = ProxyConfig {
            url: "127.0.0.1:1080".into(),
            proxy_type: ProxyType::Socks5,
            auth: None,
        };
        assert!(build_proxy_from_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_url_is_a_configuration_error() {
        let config = ProxyConfig::from_url("http://exa mple:80").with_auth("u", "p");
        assert!(matches!(
            build_proxy_from_config(&config),
            Err(DownloadError::ProxyConfiguration { .. })
        ));
    }
}

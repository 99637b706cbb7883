//! Catalog of the containerized services tasks may require, plus the
//! translation between the public URLs shown to the agent and the
//! private `container:port` addresses that resolve on the session
//! network.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Every service the harness knows how to run. Closed set: adding a
/// service means adding a variant here and filling in the match arms
/// below, and the compiler walks you to every site that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Service {
    SimpleWeb,
    Homepage,
    Shopping,
    ShoppingAdmin,
    Gitlab,
    Reddit,
    Wikipedia,
    /// The HTTP sidecar that actually drives a headless browser.
    BrowserBridge,
    /// A plain shell container. No ports, no readiness probe.
    Bash,
}

impl Service {
    pub const ALL: [Service; 9] = [
        Service::SimpleWeb,
        Service::Homepage,
        Service::Shopping,
        Service::ShoppingAdmin,
        Service::Gitlab,
        Service::Reddit,
        Service::Wikipedia,
        Service::BrowserBridge,
        Service::Bash,
    ];

    pub const ALL_NAMES: &'static str =
        "simple-web, homepage, shopping, shopping-admin, gitlab, reddit, wikipedia, browser-bridge, bash";

    /// Wire name used in task configs and as the hostname on the
    /// session network.
    pub fn name(&self) -> &'static str {
        match self {
            Service::SimpleWeb => "simple-web",
            Service::Homepage => "homepage",
            Service::Shopping => "shopping",
            Service::ShoppingAdmin => "shopping-admin",
            Service::Gitlab => "gitlab",
            Service::Reddit => "reddit",
            Service::Wikipedia => "wikipedia",
            Service::BrowserBridge => "browser-bridge",
            Service::Bash => "bash",
        }
    }

    /// Image tag to run the service from.
    pub fn image(&self) -> &'static str {
        match self {
            Service::SimpleWeb => "yeasy/simple-web:latest",
            Service::Homepage => "webtask-homepage",
            Service::Shopping => "shopping_final_0712",
            Service::ShoppingAdmin => "shopping_admin_final_0719",
            Service::Gitlab => "gitlab-populated-final-port8023",
            Service::Reddit => "postmill-populated-exposed-withimg",
            Service::Wikipedia => "ghcr.io/kiwix/kiwix-serve:3.3.0",
            Service::BrowserBridge => "webtask-browser-bridge",
            Service::Bash => "webtask-bash",
        }
    }

    /// Port the service listens on inside its container, if any.
    pub fn internal_port(&self) -> Option<u16> {
        match self {
            Service::SimpleWeb => Some(80),
            Service::Homepage => Some(4399),
            Service::Shopping => Some(80),
            Service::ShoppingAdmin => Some(80),
            Service::Gitlab => Some(8023),
            Service::Reddit => Some(80),
            Service::Wikipedia => Some(80),
            Service::BrowserBridge => Some(8507),
            Service::Bash => None,
        }
    }

    /// Host port the internal port is published on.
    pub fn external_port(&self) -> Option<u16> {
        match self {
            Service::SimpleWeb => Some(4444),
            Service::Homepage => Some(4399),
            Service::Shopping => Some(7770),
            Service::ShoppingAdmin => Some(7780),
            Service::Gitlab => Some(8023),
            Service::Reddit => Some(9999),
            Service::Wikipedia => Some(8888),
            Service::BrowserBridge => Some(8507),
            Service::Bash => None,
        }
    }

    /// Port a readiness probe should hit, or `None` for services that
    /// never answer HTTP (the bash container is ready as soon as it
    /// starts).
    pub fn probe_port(&self) -> Option<u16> {
        self.internal_port()
    }

    /// Public URL shown to the agent for this service, if it has a web
    /// surface.
    pub fn public_url(&self) -> Option<&'static str> {
        match self {
            Service::SimpleWeb => Some("http://simple-web.com"),
            Service::Homepage => Some("http://homepage.com"),
            Service::Shopping => Some("http://onestopmarket.com"),
            Service::ShoppingAdmin => Some("http://shopping-admin.com"),
            Service::Gitlab => Some("http://gitlab.com"),
            Service::Reddit => Some("http://reddit.com"),
            Service::Wikipedia => Some("http://wikipedia.org"),
            Service::BrowserBridge | Service::Bash => None,
        }
    }

    /// Address that resolves from inside the session network.
    pub fn private_url(&self) -> Option<String> {
        let port = self.internal_port()?;
        self.public_url()?;
        Some(format!("http://{}:{}", self.name(), port))
    }

    /// Private address with the port elided. Some services answer on the
    /// default HTTP port, and pages occasionally link without one.
    pub fn private_url_no_port(&self) -> Option<String> {
        self.public_url()?;
        Some(format!("http://{}", self.name()))
    }

    /// Where to fetch a cached image archive from when the image cannot
    /// be pulled. Only the heavyweight snapshots are published this way.
    pub fn download_url(&self) -> Option<&'static str> {
        match self {
            Service::Shopping => {
                Some("https://archive.webtask.dev/images/shopping_final_0712.tar")
            }
            Service::ShoppingAdmin => {
                Some("https://archive.webtask.dev/images/shopping_admin_final_0719.tar")
            }
            Service::Gitlab => {
                Some("https://archive.webtask.dev/images/gitlab-populated-final-port8023.tar")
            }
            Service::Reddit => {
                Some("https://archive.webtask.dev/images/postmill-populated-exposed-withimg.tar")
            }
            _ => None,
        }
    }

    /// Commands run inside the container once it reports ready. The
    /// shopping stacks need their base URL rewritten to the public name
    /// the agent sees.
    pub fn post_start_commands(&self) -> Vec<String> {
        match self {
            Service::Shopping => vec![
                "/var/www/magento2/bin/magento setup:store-config:set --base-url=\"http://onestopmarket.com\"".to_string(),
                "mysql -u magentouser -pMyPassword magentodb -e 'UPDATE core_config_data SET value=\"http://onestopmarket.com/\" WHERE path = \"web/secure/base_url\";'".to_string(),
                "/var/www/magento2/bin/magento cache:flush".to_string(),
            ],
            Service::ShoppingAdmin => vec![
                "/var/www/magento2/bin/magento setup:store-config:set --base-url=\"http://shopping-admin.com\"".to_string(),
                "php /var/www/magento2/bin/magento config:set admin/security/password_is_forced 0".to_string(),
                "php /var/www/magento2/bin/magento config:set admin/security/session_lifetime 7776000".to_string(),
                "/var/www/magento2/bin/magento cache:flush".to_string(),
            ],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Service {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for svc in Service::ALL {
            if svc.name() == s {
                return Ok(svc);
            }
        }
        Err(ConfigError::UnknownService(s.to_string()))
    }
}

impl TryFrom<String> for Service {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Service> for String {
    fn from(s: Service) -> String {
        s.name().to_string()
    }
}

/// True when `url` starts with `prefix` at a host boundary, so that
/// `http://reddit` matches `http://reddit/f/pics` but not
/// `http://reddit-archive/`.
fn matches_at_boundary(url: &str, prefix: &str) -> bool {
    match url.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(['/', ':', '?', '#']),
        None => false,
    }
}

/// Rewrite a public URL to its private on-network form. Returns `None`
/// when no service's public URL is a prefix of `url`.
pub fn public_to_private(url: &str) -> Option<String> {
    for svc in Service::ALL {
        let public = match svc.public_url() {
            Some(p) => p,
            None => continue,
        };
        if matches_at_boundary(url, public) {
            let private = svc.private_url()?;
            return Some(url.replacen(public, &private, 1));
        }
    }
    None
}

/// Rewrite a private on-network URL back to the public form the agent
/// sees. The ported form is tried before the portless one so that
/// `http://shopping:80/x` does not first match `http://shopping`.
pub fn private_to_public(url: &str) -> Option<String> {
    for svc in Service::ALL {
        let public = match svc.public_url() {
            Some(p) => p,
            None => continue,
        };
        if let Some(private) = svc.private_url() {
            if matches_at_boundary(url, &private) {
                return Some(url.replacen(&private, public, 1));
            }
        }
    }
    for svc in Service::ALL {
        let public = match svc.public_url() {
            Some(p) => p,
            None => continue,
        };
        if let Some(private) = svc.private_url_no_port() {
            if matches_at_boundary(url, &private) {
                return Some(url.replacen(&private, public, 1));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_round_trip() {
        for svc in Service::ALL {
            assert_eq!(svc.name().parse::<Service>().unwrap(), svc);
        }
    }

    #[test]
    fn unknown_service_is_an_error() {
        assert!("mystery-box".parse::<Service>().is_err());
    }

    #[test]
    fn public_to_private_rewrites_prefix_only() {
        assert_eq!(
            public_to_private("http://onestopmarket.com/cart").as_deref(),
            Some("http://shopping:80/cart")
        );
        assert_eq!(public_to_private("http://example.com/"), None);
    }

    #[test]
    fn private_to_public_handles_both_port_forms() {
        assert_eq!(
            private_to_public("http://shopping:80/checkout").as_deref(),
            Some("http://onestopmarket.com/checkout")
        );
        assert_eq!(
            private_to_public("http://reddit/f/pics").as_deref(),
            Some("http://reddit.com/f/pics")
        );
    }

    #[test]
    fn private_to_public_keeps_a_nonstandard_port_intact() {
        // ":8080" shares a prefix with the canonical ":80"; the rewrite
        // must not split the port digits across the hostname.
        assert_eq!(
            private_to_public("http://shopping:8080/x").as_deref(),
            Some("http://onestopmarket.com:8080/x")
        );
    }

    #[test]
    fn translation_round_trips_for_every_web_service() {
        for svc in Service::ALL {
            let Some(public) = svc.public_url() else { continue };
            let url = format!("{public}/some/path?q=1");
            let private = public_to_private(&url).unwrap();
            assert_eq!(private_to_public(&private).unwrap(), url);
        }
    }

    #[test]
    fn bash_has_no_ports_and_no_probe() {
        assert_eq!(Service::Bash.internal_port(), None);
        assert_eq!(Service::Bash.probe_port(), None);
        assert_eq!(Service::Bash.public_url(), None);
    }

    #[test]
    fn shopping_post_start_rewrites_base_url() {
        let cmds = Service::Shopping.post_start_commands();
        assert!(cmds.iter().any(|c| c.contains("onestopmarket.com")));
        assert!(Service::Bash.post_start_commands().is_empty());
    }
}

use reqwest::Url;

/// Hosts whose tabs may receive broadcasts. An entry matches the host itself
/// and any subdomain of it (`vercel.app` admits `my-app.vercel.app`).
#[derive(Debug, Clone)]
pub struct AllowList {
    hosts: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Unparsable addresses and addresses without a host never match.
    pub fn allows(&self, tab_url: &str) -> bool {
        let Ok(url) = Url::parse(tab_url) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

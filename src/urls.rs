//! Resource URLs for the object store and the project API.
//!
//! Layout served by the store:
//!
//! ```text
//! {store_url}/{org}/{project}/{revision}/{file}          revision-scoped files
//! {store_url}/{org}/{project}/_shared/{folder}/{file}    content-addressed files
//! {api_url}/projects/{project}/active-rev                active revision lookup
//! ```
//!
//! Every segment is percent-encoded, so slugs and hashes can be passed
//! through unchanged.

use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct UrlBuilder {
    store: Url,
    api: Url,
    org_slug: String,
    project_id: String,
}

fn parse_base(name: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::Validation(format!("{} '{}' is not a valid URL: {}", name, raw, e)))?;
    if url.cannot_be_a_base() {
        return Err(Error::Validation(format!("{} '{}' cannot be a base URL", name, raw)));
    }
    Ok(url)
}

fn with_segments<'a>(base: &Url, segments: impl IntoIterator<Item = &'a str>) -> String {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url.to_string()
}

impl UrlBuilder {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            store: parse_base("store_url", &config.store_url)?,
            api: parse_base("api_url", &config.api_url)?,
            org_slug: config.org_slug.clone(),
            project_id: config.project_id.clone(),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// `{store}/{org}/{project}/{revision}/{file}`; `file` may contain `/`.
    pub fn revision_url(&self, revision: &str, file: &str) -> String {
        let segments = [self.org_slug.as_str(), self.project_id.as_str(), revision]
            .into_iter()
            .chain(file.split('/').filter(|s| !s.is_empty()));
        with_segments(&self.store, segments)
    }

    /// `{store}/{org}/{project}/{revision}/{folder}/{file}`, with `file`
    /// encoded as a single segment.
    pub fn revision_folder_url(&self, revision: &str, folder: &str, file: &str) -> String {
        with_segments(
            &self.store,
            [
                self.org_slug.as_str(),
                self.project_id.as_str(),
                revision,
                folder,
                file,
            ],
        )
    }

    /// `{store}/{org}/{project}/_shared/{folder}/{file}`.
    pub fn shared_url(&self, folder: &str, file: &str) -> String {
        with_segments(
            &self.store,
            [
                self.org_slug.as_str(),
                self.project_id.as_str(),
                "_shared",
                folder,
                file,
            ],
        )
    }

    /// Project API endpoint returning the active revision.
    pub fn active_revision_url(&self) -> String {
        with_segments(
            &self.api,
            ["projects", self.project_id.as_str(), "active-rev"],
        )
    }

    /// Store root for this project, used by proxy adapters.
    pub fn project_root(&self) -> String {
        with_segments(&self.store, [self.org_slug.as_str(), self.project_id.as_str()])
    }
}

/// Pure helpers consumed by framework proxy adapters.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    root: String,
    max_age_secs: u64,
}

impl ProxyConfig {
    pub fn new(urls: &UrlBuilder, max_age_secs: u64) -> Self {
        Self {
            root: urls.project_root(),
            max_age_secs,
        }
    }

    /// Upstream URL for a request path such as `/r1/posts.json`.
    pub fn target_url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return self.root.clone();
        }
        format!("{}/{}", self.root, path)
    }

    /// Response headers for proxied store content. Revision-scoped files
    /// never change, so they may be cached aggressively downstream.
    pub fn cache_headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Cache-Control".to_string(),
                format!("public, max-age={}, immutable", self.max_age_secs),
            ),
            ("Vary".to_string(), "Accept-Encoding".to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> UrlBuilder {
        let config = ClientConfig::new(
            "acme",
            "blog",
            "https://store.test",
            "https://api.test/v1",
        );
        UrlBuilder::new(&config).unwrap()
    }

    #[test]
    fn test_revision_url() {
        let urls = builder();
        assert_eq!(
            urls.revision_url("rev123", "posts.json"),
            "https://store.test/acme/blog/rev123/posts.json"
        );
        assert_eq!(
            urls.revision_url("rev123", "_posts/hello world.json"),
            "https://store.test/acme/blog/rev123/_posts/hello%20world.json"
        );
    }

    #[test]
    fn test_shared_and_api_urls() {
        let urls = builder();
        assert_eq!(
            urls.shared_url("posts", "h1.json"),
            "https://store.test/acme/blog/_shared/posts/h1.json"
        );
        assert_eq!(
            urls.active_revision_url(),
            "https://api.test/v1/projects/blog/active-rev"
        );
    }

    #[test]
    fn test_slashes_in_segments_are_encoded() {
        let urls = builder();
        assert_eq!(
            urls.shared_url("posts", "a/b.json"),
            "https://store.test/acme/blog/_shared/posts/a%2Fb.json"
        );
    }

    #[test]
    fn test_invalid_base() {
        let config = ClientConfig::new("acme", "blog", "not a url", "https://api.test");
        assert!(matches!(
            UrlBuilder::new(&config),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_proxy_config() {
        let proxy = ProxyConfig::new(&builder(), 31_536_000);
        assert_eq!(
            proxy.target_url("/r1/posts.json"),
            "https://store.test/acme/blog/r1/posts.json"
        );
        assert_eq!(proxy.target_url(""), "https://store.test/acme/blog");
        assert_eq!(
            proxy.cache_headers()[0],
            (
                "Cache-Control".to_string(),
                "public, max-age=31536000, immutable".to_string()
            )
        );
    }
}

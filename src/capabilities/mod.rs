//! Capability surface: the host functions evaluated code can reach.
//!
//! The set is assembled once at startup from configuration and the
//! injected collaborators, then shared read-only (`Arc<CapabilitySet>`)
//! by every evaluation. A symbol that is not bound here does not exist
//! inside the sandbox: there is no ambient process, filesystem or
//! environment access.
//!
//! Capabilities run with the privileges of the host process. The caller
//! is a trusted operator; the surface exists to keep mistakes contained
//! and auditable, not to stop a hostile snippet.

pub mod buffer;
pub mod fetch;
pub mod html;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::CapabilitiesConfig;

pub use fetch::HttpFetcher;
pub use html::Html2TextExtractor;

/// One enumerable entry of the capability surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// `console.log` and friends, routed to the host log
    Console,
    /// `fetch(url)`
    Fetch,
    /// `htmlText(html)` and `webscrap(url)`
    Html,
    /// `Buffer.from` / `Buffer.alloc` / `Buffer.toString` / `Buffer.byteLength`
    Buffer,
    /// `setTimeout` / `setInterval` and their `clear*` counterparts
    Timers,
    /// `now()`
    Clock,
    /// `caller`, `ctx` and `msg` bindings for the current request
    Caller,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Console,
        Capability::Fetch,
        Capability::Html,
        Capability::Buffer,
        Capability::Timers,
        Capability::Clock,
        Capability::Caller,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::Console => "console",
            Capability::Fetch => "fetch",
            Capability::Html => "html",
            Capability::Buffer => "buffer",
            Capability::Timers => "timers",
            Capability::Clock => "clock",
            Capability::Caller => "caller",
        }
    }

    /// Global symbols this capability binds into a context.
    pub fn globals(&self) -> &'static [&'static str] {
        match self {
            Capability::Console => &["console"],
            Capability::Fetch => &["fetch"],
            Capability::Html => &["htmlText", "webscrap"],
            Capability::Buffer => &["Buffer"],
            Capability::Timers => &["setTimeout", "clearTimeout", "setInterval", "clearInterval"],
            Capability::Clock => &["now"],
            Capability::Caller => &["caller", "ctx", "msg"],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Collaborator traits ──────────────────────────────────

/// A response returned by a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Network fetch collaborator behind `fetch(url)`.
///
/// Non-2xx responses are returned, not raised: the script decides
/// what to do with `status`. Errors are transport failures.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedResponse>;
}

/// Converts raw HTML into its visible text.
pub trait HtmlExtractor: Send + Sync {
    fn extract_text(&self, html: &str) -> String;
}

/// Wall clock exposed as `now()`.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

// ── CapabilitySet ────────────────────────────────────────

/// The process-wide, read-only capability surface.
pub struct CapabilitySet {
    enabled: BTreeSet<Capability>,
    fetcher: Arc<dyn Fetcher>,
    html: Arc<dyn HtmlExtractor>,
    clock: Arc<dyn Clock>,
    /// Set when the surface was built from configuration alone, so a
    /// worker process can rebuild an identical one
    config: Option<CapabilitiesConfig>,
}

impl CapabilitySet {
    /// Builds the surface with the default host collaborators.
    pub fn from_config(config: &CapabilitiesConfig) -> Self {
        let mut set = Self::new(
            config.enabled.iter().copied(),
            Arc::new(HttpFetcher::new(config)),
            Arc::new(Html2TextExtractor::default()),
            Arc::new(SystemClock),
        );
        set.config = Some(config.clone());
        set
    }

    pub fn new(
        enabled: impl IntoIterator<Item = Capability>,
        fetcher: Arc<dyn Fetcher>,
        html: Arc<dyn HtmlExtractor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            enabled: enabled.into_iter().collect(),
            fetcher,
            html,
            clock,
            config: None,
        }
    }

    /// The configuration this set was built from. `None` when custom
    /// collaborators were injected.
    pub fn config(&self) -> Option<&CapabilitiesConfig> {
        self.config.as_ref()
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    /// Enabled capabilities, in a stable order.
    pub fn enabled(&self) -> impl Iterator<Item = Capability> + '_ {
        self.enabled.iter().copied()
    }

    /// Every global symbol a context built from this set will expose.
    pub fn global_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .enabled()
            .flat_map(|c| c.globals().iter().copied())
            // webscrap is built on fetch
            .filter(|name| *name != "webscrap" || self.is_enabled(Capability::Fetch))
            .collect();
        names.sort_unstable();
        names
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.fetcher)
    }

    pub fn html(&self) -> Arc<dyn HtmlExtractor> {
        Arc::clone(&self.html)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Comma-separated list of enabled capabilities, for startup logs.
    pub fn describe(&self) -> String {
        self.enabled()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes for the capability collaborators.

    use super::*;
    use std::collections::HashMap;

    /// Serves canned pages; unknown URLs fail like a DNS error would.
    #[derive(Default)]
    pub struct StaticFetcher {
        pages: HashMap<String, (u16, String, String)>,
    }

    impl StaticFetcher {
        pub fn with_page(mut self, url: &str, content_type: &str, body: &str) -> Self {
            self.pages.insert(
                url.to_string(),
                (200, content_type.to_string(), body.to_string()),
            );
            self
        }

        pub fn with_status(mut self, url: &str, status: u16) -> Self {
            self.pages
                .insert(url.to_string(), (status, "text/plain".to_string(), String::new()));
            self
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<FetchedResponse> {
            let (status, content_type, body) = self
                .pages
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("connection refused: {url}"))?;
            Ok(FetchedResponse {
                url: url.to_string(),
                status,
                content_type,
                body: body.into_bytes(),
            })
        }
    }

    pub struct FixedClock(pub i64);

    impl Clock for FixedClock {
        fn now_millis(&self) -> i64 {
            self.0
        }
    }

    /// A capability set wired entirely to fakes.
    pub fn fake_capabilities(fetcher: StaticFetcher) -> Arc<CapabilitySet> {
        Arc::new(CapabilitySet::new(
            Capability::ALL,
            Arc::new(fetcher),
            Arc::new(Html2TextExtractor::default()),
            Arc::new(FixedClock(1_700_000_000_000)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_all_capabilities_have_globals() {
        for capability in Capability::ALL {
            assert!(!capability.globals().is_empty(), "{capability} binds nothing");
        }
    }

    #[test]
    fn test_global_names_full_surface() {
        let caps = fake_capabilities(StaticFetcher::default());
        let names = caps.global_names();
        for expected in ["console", "fetch", "webscrap", "htmlText", "Buffer", "setTimeout", "now", "caller"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert!(!names.contains(&"process"));
        assert!(!names.contains(&"require"));
    }

    #[test]
    fn test_global_names_html_without_fetch() {
        let caps = CapabilitySet::new(
            [Capability::Html],
            Arc::new(StaticFetcher::default()),
            Arc::new(Html2TextExtractor::default()),
            Arc::new(SystemClock),
        );
        assert_eq!(caps.global_names(), vec!["htmlText"]);
    }

    #[test]
    fn test_is_enabled_respects_config() {
        let caps = CapabilitySet::new(
            [Capability::Console, Capability::Timers],
            Arc::new(StaticFetcher::default()),
            Arc::new(Html2TextExtractor::default()),
            Arc::new(SystemClock),
        );
        assert!(caps.is_enabled(Capability::Console));
        assert!(!caps.is_enabled(Capability::Fetch));
        assert_eq!(caps.describe(), "console, timers");
        assert!(caps.config().is_none());
    }

    #[test]
    fn test_from_config_remembers_config() {
        let config = CapabilitiesConfig {
            enabled: vec![Capability::Clock],
            ..CapabilitiesConfig::default()
        };
        let caps = CapabilitySet::from_config(&config);
        assert_eq!(caps.config().map(|c| c.enabled.clone()), Some(vec![Capability::Clock]));
    }

    #[test]
    fn test_capability_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            caps: Vec<Capability>,
        }
        let w: Wrapper = toml::from_str(r#"caps = ["fetch", "html", "clock"]"#).unwrap();
        assert_eq!(w.caps, vec![Capability::Fetch, Capability::Html, Capability::Clock]);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2023-11-14 and later
        assert!(SystemClock.now_millis() > 1_700_000_000_000);
    }

    #[test]
    fn test_fetched_response_text_lossy() {
        let response = FetchedResponse {
            url: "https://example.com".to_string(),
            status: 200,
            content_type: "text/plain".to_string(),
            body: vec![b'h', b'i', 0xFF],
        };
        assert!(response.text().starts_with("hi"));
    }
}

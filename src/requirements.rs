//! Script and stylesheet requirements and their loading order.
//!
//! Packages load concurrently with one another. Inside a package, `js`
//! requirements load strictly in order (later scripts may depend on globals
//! defined by earlier ones) while everything else loads in parallel. Once
//! every package is done, page-level requirements load one at a time in
//! array order. The first failure aborts the whole pass.
//!
//! Inserting assets into a document is the host's business; the loader
//! talks to it through the [`AssetHost`] trait.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AssetLoadError;

/// What kind of asset a requirement is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequirementKind {
    /// A script.
    Js,
    /// A stylesheet.
    Css,
    /// A source map marker; nothing to load.
    Map,
    /// Anything else. Rejected when loaded.
    Other(String),
}

impl From<String> for RequirementKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "js" => RequirementKind::Js,
            "css" => RequirementKind::Css,
            "map" => RequirementKind::Map,
            _ => RequirementKind::Other(kind),
        }
    }
}

impl From<RequirementKind> for String {
    fn from(kind: RequirementKind) -> Self {
        match kind {
            RequirementKind::Js => "js".to_owned(),
            RequirementKind::Css => "css".to_owned(),
            RequirementKind::Map => "map".to_owned(),
            RequirementKind::Other(kind) => kind,
        }
    }
}

/// A single loadable asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Asset URL, absolute or relative to the page.
    pub url: String,
    /// Asset kind.
    pub kind: RequirementKind,
}

impl Requirement {
    /// A script requirement.
    pub fn js(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: RequirementKind::Js,
        }
    }

    /// A stylesheet requirement.
    pub fn css(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: RequirementKind::Css,
        }
    }
}

/// A named bundle of requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// The package's assets.
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

/// Inserts assets into whatever plays the role of the document.
#[async_trait]
pub trait AssetHost: Send + Sync + 'static {
    /// Load and execute a script; resolves once it is available.
    async fn load_script(&self, url: &str) -> Result<(), AssetLoadError>;

    /// Load a stylesheet. Loading a URL that is already present replaces
    /// it with a freshly fetched copy.
    async fn load_stylesheet(&self, url: &str) -> Result<(), AssetLoadError>;

    /// Remove a previously loaded stylesheet.
    async fn remove_stylesheet(&self, _url: &str) -> Result<(), AssetLoadError> {
        Ok(())
    }
}

/// Drives an [`AssetHost`] in requirement order.
#[derive(Clone)]
pub struct RequirementLoader {
    host: Arc<dyn AssetHost>,
    timeout: Duration,
}

impl std::fmt::Debug for RequirementLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequirementLoader")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RequirementLoader {
    /// Create a loader bounding every single load by `timeout`.
    pub fn new(host: Arc<dyn AssetHost>, timeout: Duration) -> Self {
        Self { host, timeout }
    }

    /// The underlying host.
    pub fn host(&self) -> &Arc<dyn AssetHost> {
        &self.host
    }

    /// Load one requirement. `map` requirements resolve immediately.
    ///
    /// # Errors
    ///
    /// * [`AssetLoadError::UnknownKind`] -- the kind is not `js`, `css` or `map`.
    /// * [`AssetLoadError::Timeout`] -- the host did not finish in time.
    /// * whatever the host reports.
    pub async fn load_requirement(&self, requirement: &Requirement) -> Result<(), AssetLoadError> {
        let url = requirement.url.as_str();
        let load = async {
            match &requirement.kind {
                RequirementKind::Js => self.host.load_script(url).await,
                RequirementKind::Css => self.host.load_stylesheet(url).await,
                RequirementKind::Map => Ok(()),
                RequirementKind::Other(kind) => Err(AssetLoadError::UnknownKind {
                    url: url.to_owned(),
                    kind: kind.clone(),
                }),
            }
        };
        tokio::time::timeout(self.timeout, load)
            .await
            .map_err(|_| AssetLoadError::Timeout {
                url: url.to_owned(),
            })?
    }

    /// Load every package, then the page-level requirements.
    ///
    /// # Errors
    ///
    /// Returns the first [`AssetLoadError`] encountered; remaining loads
    /// are abandoned.
    pub async fn load_requirements(
        &self,
        requirements: &[Requirement],
        packages: &BTreeMap<String, Package>,
    ) -> Result<(), AssetLoadError> {
        try_join_all(
            packages
                .iter()
                .map(|(name, package)| self.load_package(name, package)),
        )
        .await?;

        for requirement in requirements {
            self.load_requirement(requirement).await?;
        }
        tracing::debug!(
            packages = packages.len(),
            requirements = requirements.len(),
            "requirements loaded"
        );
        Ok(())
    }

    async fn load_package(&self, name: &str, package: &Package) -> Result<(), AssetLoadError> {
        tracing::debug!(package = %name, "loading package");
        let scripts = async {
            for requirement in package
                .requirements
                .iter()
                .filter(|r| r.kind == RequirementKind::Js)
            {
                self.load_requirement(requirement).await?;
            }
            Ok::<(), AssetLoadError>(())
        };
        let others = try_join_all(
            package
                .requirements
                .iter()
                .filter(|r| r.kind != RequirementKind::Js)
                .map(|r| self.load_requirement(r)),
        );
        tokio::try_join!(scripts, others)?;
        Ok(())
    }
}

/// An asset held by [`HttpAssetHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAsset {
    /// The requirement URL as given.
    pub url: String,
    /// The fetched body.
    pub body: String,
}

/// Snapshot of the assets an [`HttpAssetHost`] has loaded, in load order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentHead {
    /// Scripts.
    pub scripts: Vec<LoadedAsset>,
    /// Stylesheets.
    pub stylesheets: Vec<LoadedAsset>,
}

/// Headless [`AssetHost`]: fetches assets over HTTP and keeps them in an
/// in-memory document head.
#[derive(Debug)]
pub struct HttpAssetHost {
    client: reqwest::Client,
    base: Url,
    head: Mutex<DocumentHead>,
}

impl HttpAssetHost {
    /// Resolve relative requirement URLs against `base` (the page URL).
    pub fn new(base: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    /// Use an existing HTTP client.
    pub fn with_client(client: reqwest::Client, base: Url) -> Self {
        Self {
            client,
            base,
            head: Mutex::new(DocumentHead::default()),
        }
    }

    /// Snapshot of the loaded assets.
    pub fn head(&self) -> DocumentHead {
        self.head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn resolve(&self, url: &str) -> Result<Url, AssetLoadError> {
        self.base.join(url).map_err(|e| AssetLoadError::Failed {
            url: url.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn fetch(&self, requested: &str, url: Url) -> Result<String, AssetLoadError> {
        let failed = |reason: String| AssetLoadError::Failed {
            url: requested.to_owned(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP status {status}")));
        }
        response.text().await.map_err(|e| failed(e.to_string()))
    }
}

/// `url` with a fresh `v=<uuid>` query parameter, bypassing caches.
fn cache_busted(mut url: Url) -> Url {
    url.query_pairs_mut()
        .append_pair("v", &uuid::Uuid::new_v4().to_string());
    url
}

#[async_trait]
impl AssetHost for HttpAssetHost {
    async fn load_script(&self, url: &str) -> Result<(), AssetLoadError> {
        let body = self.fetch(url, self.resolve(url)?).await?;
        self.head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .scripts
            .push(LoadedAsset {
                url: url.to_owned(),
                body,
            });
        tracing::debug!(url = %url, "script loaded");
        Ok(())
    }

    async fn load_stylesheet(&self, url: &str) -> Result<(), AssetLoadError> {
        let reloading = {
            let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
            let before = head.stylesheets.len();
            head.stylesheets.retain(|sheet| sheet.url != url);
            head.stylesheets.len() != before
        };
        let resolved = self.resolve(url)?;
        let target = if reloading {
            cache_busted(resolved)
        } else {
            resolved
        };
        let body = self.fetch(url, target).await?;
        self.head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stylesheets
            .push(LoadedAsset {
                url: url.to_owned(),
                body,
            });
        tracing::debug!(url = %url, reloaded = reloading, "stylesheet loaded");
        Ok(())
    }

    async fn remove_stylesheet(&self, url: &str) -> Result<(), AssetLoadError> {
        self.head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stylesheets
            .retain(|sheet| sheet.url != url);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Records `start:<url>` / `end:<url>` and sleeps per URL.
    #[derive(Default)]
    pub(crate) struct RecordingHost {
        pub log: Mutex<Vec<String>>,
        pub delays: BTreeMap<String, Duration>,
        pub failing: Vec<String>,
    }

    impl RecordingHost {
        pub(crate) fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        async fn record(&self, url: &str) -> Result<(), AssetLoadError> {
            self.log.lock().unwrap().push(format!("start:{url}"));
            if let Some(delay) = self.delays.get(url) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing.iter().any(|f| f == url) {
                return Err(AssetLoadError::Failed {
                    url: url.to_owned(),
                    reason: "boom".into(),
                });
            }
            self.log.lock().unwrap().push(format!("end:{url}"));
            Ok(())
        }
    }

    #[async_trait]
    impl AssetHost for RecordingHost {
        async fn load_script(&self, url: &str) -> Result<(), AssetLoadError> {
            self.record(url).await
        }

        async fn load_stylesheet(&self, url: &str) -> Result<(), AssetLoadError> {
            self.record(url).await
        }

        async fn remove_stylesheet(&self, url: &str) -> Result<(), AssetLoadError> {
            self.log.lock().unwrap().push(format!("remove:{url}"));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingHost;
    use super::*;
    use serde_json::json;

    fn position(log: &[String], entry: &str) -> usize {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry} missing from {log:?}"))
    }

    #[test]
    fn kind_round_trips_through_strings() {
        let req: Requirement =
            serde_json::from_value(json!({"url": "/a.wasm", "kind": "wasm"})).unwrap();
        assert_eq!(req.kind, RequirementKind::Other("wasm".into()));
        assert_eq!(serde_json::to_value(&req).unwrap()["kind"], json!("wasm"));
        let css: Requirement = serde_json::from_value(json!({"url": "/a.css", "kind": "css"})).unwrap();
        assert_eq!(css, Requirement::css("/a.css"));
    }

    #[tokio::test(start_paused = true)]
    async fn package_scripts_then_page_requirements_in_order() {
        let mut host = RecordingHost::default();
        host.delays.insert("a1.js".into(), Duration::from_millis(50));
        host.delays.insert("p1.js".into(), Duration::from_millis(20));
        let host = Arc::new(host);
        let loader = RequirementLoader::new(host.clone(), Duration::from_secs(5));

        let packages = BTreeMap::from([(
            "A".to_owned(),
            Package {
                requirements: vec![Requirement::js("a1.js"), Requirement::js("a2.js")],
            },
        )]);
        let page = [Requirement::js("p1.js"), Requirement::js("p2.js")];
        loader.load_requirements(&page, &packages).await.unwrap();

        let log = host.log();
        assert!(position(&log, "end:a1.js") < position(&log, "start:a2.js"));
        assert!(position(&log, "end:a2.js") < position(&log, "start:p1.js"));
        assert!(position(&log, "end:p1.js") < position(&log, "start:p2.js"));
    }

    #[tokio::test(start_paused = true)]
    async fn package_stylesheets_load_in_parallel() {
        let mut host = RecordingHost::default();
        host.delays.insert("a.css".into(), Duration::from_millis(50));
        host.delays.insert("b.css".into(), Duration::from_millis(50));
        let host = Arc::new(host);
        let loader = RequirementLoader::new(host.clone(), Duration::from_secs(5));
        let packages = BTreeMap::from([(
            "A".to_owned(),
            Package {
                requirements: vec![Requirement::css("a.css"), Requirement::css("b.css")],
            },
        )]);
        loader.load_requirements(&[], &packages).await.unwrap();

        let log = host.log();
        assert!(position(&log, "start:b.css") < position(&log, "end:a.css"));
    }

    #[tokio::test]
    async fn map_is_a_noop_and_unknown_kind_rejects() {
        let host = Arc::new(RecordingHost::default());
        let loader = RequirementLoader::new(host.clone(), Duration::from_secs(5));
        let map = Requirement {
            url: "/a.js.map".into(),
            kind: RequirementKind::Map,
        };
        loader.load_requirement(&map).await.unwrap();
        assert!(host.log().is_empty());

        let wasm = Requirement {
            url: "/a.wasm".into(),
            kind: RequirementKind::Other("wasm".into()),
        };
        let err = loader.load_requirement(&wasm).await.unwrap_err();
        assert!(matches!(err, AssetLoadError::UnknownKind { ref kind, .. } if kind == "wasm"));
    }

    #[tokio::test]
    async fn single_failure_rejects_the_pass() {
        let host = Arc::new(RecordingHost {
            failing: vec!["p1.js".into()],
            ..RecordingHost::default()
        });
        let loader = RequirementLoader::new(host.clone(), Duration::from_secs(5));
        let page = [Requirement::js("p1.js"), Requirement::js("p2.js")];
        let err = loader
            .load_requirements(&page, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AssetLoadError::Failed { .. }));
        assert!(!host.log().contains(&"start:p2.js".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_asset_times_out() {
        let mut host = RecordingHost::default();
        host.delays.insert("slow.js".into(), Duration::from_secs(60));
        let loader = RequirementLoader::new(Arc::new(host), Duration::from_secs(1));
        let err = loader
            .load_requirement(&Requirement::js("slow.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, AssetLoadError::Timeout { ref url } if url == "slow.js"));
    }

    #[test]
    fn cache_busting_appends_uuid_version() {
        let url = Url::parse("http://localhost/static/app.css?theme=dark").unwrap();
        let busted = cache_busted(url);
        let pairs: Vec<(String, String)> = busted.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("theme".into(), "dark".into()));
        assert_eq!(pairs[1].0, "v");
        assert!(uuid::Uuid::parse_str(&pairs[1].1).is_ok());
    }
}

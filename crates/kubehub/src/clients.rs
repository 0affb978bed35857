use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{self, Event};
use kube::{Client, Config};
use metrics::counter;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use fleetplane_core::Actor;

use crate::impersonate::{impersonated_config, Identity, ScopedClient};
use crate::{strip_managed_fields, ClusterBackend, KubeHubError, ResourceSpec, WatchEvent, WatchParams, WatchStream};

/// A cluster reachable by a bare API endpoint and bearer token.
///
/// Parsed from `name|host|token`; all three parts are trimmed and must be non-empty.
#[derive(Debug, Clone)]
pub struct StaticCluster {
    pub name: String,
    pub host: String,
    pub token: SecretString,
}

impl FromStr for StaticCluster {
    type Err = KubeHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').map(str::trim).collect();
        match parts.as_slice() {
            [name, host, token] if !name.is_empty() && !host.is_empty() && !token.is_empty() => Ok(Self {
                name: name.to_string(),
                host: host.to_string(),
                token: SecretString::new(token.to_string()),
            }),
            [_, _, _] => Err(KubeHubError::InvalidConfig(format!("static cluster {s:?}: name, host and token must be set"))),
            _ => Err(KubeHubError::InvalidConfig(format!("static cluster {s:?}: expected name|host|token"))),
        }
    }
}

impl StaticCluster {
    /// Parse a comma separated list of static cluster entries.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, KubeHubError> {
        s.split(',').map(str::trim).filter(|e| !e.is_empty()).map(str::parse).collect()
    }

    fn endpoint(&self) -> String {
        if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("https://{}", self.host)
        }
    }
}

/// Where a cluster's connection settings come from.
#[derive(Debug, Clone)]
pub enum ClusterSource {
    /// A kubeconfig context with the same name as the cluster.
    Context(String),
    Static(StaticCluster),
    /// The service account of the pod we run in.
    InCluster(String),
}

impl ClusterSource {
    pub fn name(&self) -> &str {
        match self {
            ClusterSource::Context(n) | ClusterSource::InCluster(n) => n,
            ClusterSource::Static(s) => &s.name,
        }
    }

    pub async fn config(&self) -> Result<Config, KubeHubError> {
        match self {
            ClusterSource::Context(ctx) => {
                let kubeconfig = Kubeconfig::read().map_err(|e| KubeHubError::InvalidConfig(format!("reading kubeconfig: {e}")))?;
                let opts = KubeConfigOptions { context: Some(ctx.clone()), ..Default::default() };
                Config::from_custom_kubeconfig(kubeconfig, &opts)
                    .await
                    .map_err(|e| KubeHubError::InvalidConfig(format!("context {ctx}: {e}")))
            }
            ClusterSource::Static(sc) => {
                let endpoint = sc.endpoint();
                let url = endpoint
                    .parse()
                    .map_err(|e| KubeHubError::InvalidConfig(format!("static cluster {}: {endpoint}: {e}", sc.name)))?;
                let mut config = Config::new(url);
                config.auth_info.token = Some(SecretString::new(sc.token.expose_secret().clone()));
                Ok(config)
            }
            ClusterSource::InCluster(_) => {
                Config::incluster().map_err(|e| KubeHubError::InvalidConfig(format!("in-cluster config: {e}")))
            }
        }
    }
}

/// Connection to one cluster. The kube client serves typed and dynamic requests alike.
#[derive(Clone)]
pub struct ClusterClientSet {
    name: String,
    config: Config,
    client: Client,
}

impl std::fmt::Debug for ClusterClientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClientSet").field("name", &self.name).field("url", &self.config.cluster_url).finish()
    }
}

impl ClusterClientSet {
    pub fn new(name: impl Into<String>, config: Config) -> Result<Self, KubeHubError> {
        let client = Client::try_from(config.clone())?;
        Ok(Self { name: name.into(), config, client })
    }

    pub async fn connect(source: &ClusterSource) -> Result<Self, KubeHubError> {
        let config = source.config().await?;
        info!(cluster = %source.name(), url = %config.cluster_url, "cluster client configured");
        Self::new(source.name(), config)
    }

    /// Build one client set per source. Fails on the first misconfigured cluster.
    pub async fn connect_all(sources: &[ClusterSource]) -> Result<Vec<Self>, KubeHubError> {
        let mut out = Vec::with_capacity(sources.len());
        for source in sources {
            out.push(Self::connect(source).await?);
        }
        Ok(out)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn to_event(ev: Event<DynamicObject>) -> Result<WatchEvent, KubeHubError> {
    let raw = |o: &DynamicObject| -> Result<serde_json::Value, KubeHubError> {
        let mut v = serde_json::to_value(o)?;
        strip_managed_fields(&mut v);
        Ok(v)
    };
    Ok(match ev {
        Event::Applied(o) => WatchEvent::Applied(raw(&o)?),
        Event::Deleted(o) => WatchEvent::Deleted(raw(&o)?),
        Event::Restarted(list) => WatchEvent::Restarted(list.iter().map(raw).collect::<Result<_, _>>()?),
    })
}

#[async_trait]
impl ClusterBackend for ClusterClientSet {
    fn cluster(&self) -> &str {
        &self.name
    }

    fn watch(&self, resource: &ResourceSpec, params: &WatchParams) -> WatchStream {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource.api_resource);
        let mut cfg = watcher::Config::default();
        if let Some(l) = &params.label_selector {
            cfg = cfg.labels(l);
        }
        if let Some(f) = &params.field_selector {
            cfg = cfg.fields(f);
        }
        let cluster = self.name.clone();
        let gvr = resource.gvr();
        debug!(cluster = %cluster, gvr = %gvr, ?params, "starting list+watch");
        watcher::watcher(api, cfg)
            .map(move |res| {
                let ev = res.map_err(KubeHubError::from).and_then(to_event);
                if let Ok(WatchEvent::Restarted(list)) = &ev {
                    debug!(cluster = %cluster, gvr = %gvr, count = list.len(), "watch (re)listed");
                    counter!("kubehub_relists_total", 1u64, "cluster" => cluster.clone());
                }
                ev
            })
            .boxed()
    }

    async fn delete(&self, resource: &ResourceSpec, actor: &Actor, namespace: &str, name: &str) -> Result<(), KubeHubError> {
        self.impersonated(resource, actor)?.namespace(namespace).delete(name).await
    }

    fn impersonated(&self, resource: &ResourceSpec, actor: &Actor) -> Result<ScopedClient, KubeHubError> {
        let client = Client::try_from(impersonated_config(&self.config, actor))?;
        Ok(ScopedClient::new(&self.name, client, resource.clone(), Identity::User(actor.clone())))
    }

    fn system(&self, resource: &ResourceSpec) -> Result<ScopedClient, KubeHubError> {
        Ok(ScopedClient::new(&self.name, self.client.clone(), resource.clone(), Identity::System))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_static_clusters() {
        let list = StaticCluster::parse_list(" dev | 10.0.0.1 | abc ,prod|https://k8s.example:6443|def").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "dev");
        assert_eq!(list[0].endpoint(), "https://10.0.0.1");
        assert_eq!(list[0].token.expose_secret(), "abc");
        assert_eq!(list[1].endpoint(), "https://k8s.example:6443");
        assert!(StaticCluster::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn rejects_incomplete_static_clusters() {
        assert!("dev|host".parse::<StaticCluster>().is_err());
        assert!("dev| |token".parse::<StaticCluster>().is_err());
        assert!("a|b|c|d".parse::<StaticCluster>().is_err());
    }

    #[test]
    fn static_token_is_not_printed() {
        let sc: StaticCluster = "dev|host|supersecret".parse().unwrap();
        assert!(!format!("{sc:?}").contains("supersecret"));
    }

    #[tokio::test]
    async fn static_source_builds_bearer_config() {
        let sc: StaticCluster = "dev|127.0.0.1:6443|tok".parse().unwrap();
        let cfg = ClusterSource::Static(sc).config().await.unwrap();
        assert_eq!(cfg.cluster_url.host(), Some("127.0.0.1"));
        assert_eq!(cfg.cluster_url.port_u16(), Some(6443));
        assert_eq!(cfg.auth_info.token.as_ref().map(|t| t.expose_secret().as_str()), Some("tok"));
        assert!(cfg.auth_info.impersonate.is_none());
    }
}

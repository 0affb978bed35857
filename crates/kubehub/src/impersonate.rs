//! Request-scoped clients acting as a user (Impersonate-User / Impersonate-Group)
//! or as the service itself.

use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::{Client, Config};
use tracing::info;

use fleetplane_core::Actor;

use crate::{KubeHubError, ResourceSpec};

/// Who a scoped client acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(Actor),
    System,
}

impl Identity {
    fn user(&self) -> &str {
        match self {
            Identity::User(a) => &a.user,
            Identity::System => "system",
        }
    }
}

/// Copy of `base` that impersonates `actor`.
pub fn impersonated_config(base: &Config, actor: &Actor) -> Config {
    let mut cfg = base.clone();
    cfg.auth_info.impersonate = Some(actor.user.clone());
    cfg.auth_info.impersonate_groups = if actor.groups.is_empty() { None } else { Some(actor.groups.clone()) };
    cfg
}

/// A client bound to one cluster, one resource and one identity.
#[derive(Clone)]
pub struct ScopedClient {
    cluster: String,
    client: Client,
    resource: ResourceSpec,
    identity: Identity,
}

impl ScopedClient {
    pub fn new(cluster: &str, client: Client, resource: ResourceSpec, identity: Identity) -> Self {
        Self { cluster: cluster.to_string(), client, resource, identity }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn resource(&self) -> &ResourceSpec {
        &self.resource
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Same client and identity, different resource.
    pub fn for_resource(&self, resource: ResourceSpec) -> Self {
        Self { resource, ..self.clone() }
    }

    pub fn namespace(&self, namespace: &str) -> ImpersonatedWriteClient {
        ImpersonatedWriteClient {
            cluster: self.cluster.clone(),
            namespace: namespace.to_string(),
            gvr: self.resource.gvr(),
            user: self.identity.user().to_string(),
            api: Api::namespaced_with(self.client.clone(), namespace, &self.resource.api_resource),
        }
    }
}

/// One mutation (or read-back) in one namespace. Long-term state is read through the cache.
pub struct ImpersonatedWriteClient {
    cluster: String,
    namespace: String,
    gvr: String,
    user: String,
    api: Api<DynamicObject>,
}

impl ImpersonatedWriteClient {
    pub async fn get(&self, name: &str) -> Result<serde_json::Value, KubeHubError> {
        let obj = self.api.get(name).await?;
        Ok(serde_json::to_value(obj)?)
    }

    pub async fn create(&self, obj: serde_json::Value) -> Result<serde_json::Value, KubeHubError> {
        let obj: DynamicObject = serde_json::from_value(obj)?;
        let created = self.api.create(&PostParams::default(), &obj).await?;
        info!(cluster = %self.cluster, namespace = %self.namespace, gvr = %self.gvr, user = %self.user, name = ?created.metadata.name, "created");
        Ok(serde_json::to_value(created)?)
    }

    pub async fn delete(&self, name: &str) -> Result<(), KubeHubError> {
        self.api.delete(name, &DeleteParams::default()).await?;
        info!(cluster = %self.cluster, namespace = %self.namespace, gvr = %self.gvr, user = %self.user, %name, "deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClusterBackend;
    use crate::ClusterClientSet;
    use k8s_openapi::api::batch::v1::Job;

    fn base() -> Config {
        Config::new("https://127.0.0.1:6443".parse().unwrap())
    }

    #[test]
    fn impersonation_sets_user_and_groups() {
        let actor = Actor::new("ola@example.com", vec!["team-a".into(), "team-b".into()]);
        let cfg = impersonated_config(&base(), &actor);
        assert_eq!(cfg.auth_info.impersonate.as_deref(), Some("ola@example.com"));
        assert_eq!(cfg.auth_info.impersonate_groups, Some(vec!["team-a".to_string(), "team-b".to_string()]));
        assert_eq!(cfg.cluster_url, base().cluster_url);
    }

    #[test]
    fn no_groups_means_no_group_header() {
        let cfg = impersonated_config(&base(), &Actor::new("u", vec![]));
        assert!(cfg.auth_info.impersonate_groups.is_none());
    }

    #[tokio::test]
    async fn scoped_clients_keep_identity_and_resource() {
        let set = ClusterClientSet::new("dev", base()).unwrap();
        let jobs = ResourceSpec::of::<Job>();
        let actor = Actor::new("u", vec![]);
        let scoped = set.impersonated(&jobs, &actor).unwrap();
        assert_eq!(scoped.cluster(), "dev");
        assert_eq!(scoped.identity(), &Identity::User(actor));
        assert_eq!(scoped.resource().gvr(), "batch/v1/jobs");

        let apps = ResourceSpec::new("nais.io", "v1alpha1", "Application", "applications");
        assert_eq!(scoped.for_resource(apps.clone()).resource(), &apps);
        assert_eq!(set.system(&jobs).unwrap().identity(), &Identity::System);
    }
}

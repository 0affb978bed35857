//! Projections that shrink pods and jobs to the fields the platform reads.

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

const LABELS_TO_KEEP: &[&str] = &["app", "team"];

fn remove_path(v: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else { return };
    let parent: String = parents.iter().map(|p| format!("/{p}")).collect();
    if let Some(obj) = v.pointer_mut(&parent).and_then(Value::as_object_mut) {
        obj.remove(*last);
    }
}

fn slim_containers(containers: Option<&Value>) -> Result<Vec<Value>> {
    let Some(list) = containers else { return Ok(Vec::new()) };
    let list = list.as_array().ok_or_else(|| anyhow!("containers is not a list"))?;
    list.iter()
        .map(|c| {
            let c = c.as_object().ok_or_else(|| anyhow!("container is not an object"))?;
            Ok(json!({
                "name": c.get("name").cloned().unwrap_or(Value::Null),
                "image": c.get("image").and_then(Value::as_str).unwrap_or_default()
            }))
        })
        .collect()
}

fn keep_labels(v: &mut Value) {
    if let Some(labels) = v.pointer_mut("/metadata/labels").and_then(Value::as_object_mut) {
        labels.retain(|k, _| LABELS_TO_KEEP.contains(&k.as_str()));
    }
}

fn strip_metadata(v: &mut Value, extra: &[&str]) {
    for field in ["generateName", "ownerReferences", "annotations", "managedFields"].iter().chain(extra) {
        remove_path(v, &["metadata", *field]);
    }
}

fn set_path(v: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else { return Ok(()) };
    let mut cur = v;
    for p in parents {
        let obj = cur.as_object_mut().ok_or_else(|| anyhow!("{p} parent is not an object"))?;
        cur = obj.entry(p.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
    cur.as_object_mut().ok_or_else(|| anyhow!("{last} parent is not an object"))?.insert(last.to_string(), value);
    Ok(())
}

/// Pod projection: metadata without owner/annotation noise, `app`/`team` labels,
/// containers as `{name, image}` and the container statuses.
pub fn transform_pod(mut pod: Value) -> Result<Value> {
    let containers = slim_containers(pod.pointer("/spec/containers"))?;
    let statuses = pod.pointer("/status/containerStatuses").cloned();
    remove_path(&mut pod, &["spec"]);
    remove_path(&mut pod, &["status"]);
    strip_metadata(&mut pod, &[]);
    keep_labels(&mut pod);
    set_path(&mut pod, &["spec", "containers"], Value::Array(containers))?;
    if let Some(statuses) = statuses {
        set_path(&mut pod, &["status", "containerStatuses"], statuses)?;
    }
    Ok(pod)
}

/// Job projection: like pods, but the status is kept (minus init container statuses)
/// and containers live in the pod template.
pub fn transform_job(mut job: Value) -> Result<Value> {
    let containers = slim_containers(job.pointer("/spec/template/spec/containers"))?;
    remove_path(&mut job, &["spec"]);
    remove_path(&mut job, &["status", "initContainerStatuses"]);
    strip_metadata(&mut job, &["creationTimestamp"]);
    keep_labels(&mut job);
    set_path(&mut job, &["spec", "template", "spec", "containers"], Value::Array(containers))?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::Pod;

    fn pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "payments-7d9f",
                "namespace": "payments",
                "generateName": "payments-",
                "labels": {"app": "payments", "team": "payments", "pod-template-hash": "7d9f"},
                "annotations": {"a": "b"},
                "ownerReferences": [{"kind": "ReplicaSet", "name": "payments-7d9"}]
            },
            "spec": {
                "nodeName": "node-1",
                "containers": [{"name": "payments-api", "image": "ghcr.io/x/payments:1", "env": [{"name": "A"}]}]
            },
            "status": {"phase": "Running", "containerStatuses": [{"name": "payments-api", "ready": true, "restartCount": 2, "image": "i", "imageID": ""}]}
        })
    }

    #[test]
    fn pod_keeps_only_what_is_read() {
        let out = transform_pod(pod()).unwrap();
        assert_eq!(out["metadata"]["labels"], json!({"app": "payments", "team": "payments"}));
        assert!(out["metadata"].get("annotations").is_none());
        assert!(out["metadata"].get("ownerReferences").is_none());
        assert!(out["metadata"].get("generateName").is_none());
        assert_eq!(out["spec"], json!({"containers": [{"name": "payments-api", "image": "ghcr.io/x/payments:1"}]}));
        assert!(out["status"].get("phase").is_none());
        assert_eq!(out["status"]["containerStatuses"][0]["restartCount"], 2);
        let typed: Pod = serde_json::from_value(out).unwrap();
        assert_eq!(typed.spec.unwrap().containers[0].name, "payments-api");
    }

    #[test]
    fn job_keeps_status_and_template_containers() {
        let job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "nightly", "namespace": "team-a", "creationTimestamp": "2024-01-01T00:00:00Z", "labels": {"app": "nightly", "controller-uid": "x"}},
            "spec": {"backoffLimit": 3, "template": {"spec": {"restartPolicy": "Never", "containers": [{"name": "main", "image": "busybox"}]}}},
            "status": {"succeeded": 1, "initContainerStatuses": []}
        });
        let out = transform_job(job).unwrap();
        assert!(out["metadata"].get("creationTimestamp").is_none());
        assert_eq!(out["metadata"]["labels"], json!({"app": "nightly"}));
        assert_eq!(out["status"], json!({"succeeded": 1}));
        let typed: Job = serde_json::from_value(out).unwrap();
        let containers = typed.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers[0].image.as_deref(), Some("busybox"));
    }

    #[test]
    fn malformed_containers_are_rejected() {
        let bad = json!({"metadata": {"name": "x"}, "spec": {"containers": "nope"}});
        assert!(transform_pod(bad).is_err());
    }
}

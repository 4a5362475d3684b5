//! Shared Kubernetes client utilities

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Get a Kubernetes client
pub async fn get_k8s_client() -> Result<Client> {
    Client::try_default()
        .await
        .context("Failed to create Kubernetes client")
}

/// Phase and readiness of the first pod matching `app=<app_label>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodReadiness {
    pub phase: String,
    pub is_ready: bool,
}

/// Current readiness, without waiting
pub async fn check_pod_ready(client: &Client, namespace: &str, app_label: &str) -> Result<PodReadiness> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let label_selector = format!("app={}", app_label);

    let pod_list = pods
        .list(&ListParams::default().labels(&label_selector))
        .await
        .with_context(|| format!("Failed to list pods with {}", label_selector))?;

    Ok(pod_list
        .items
        .first()
        .map(pod_readiness)
        .unwrap_or_else(|| PodReadiness {
            phase: "NotFound".to_string(),
            is_ready: false,
        }))
}

fn pod_readiness(pod: &Pod) -> PodReadiness {
    let Some(status) = &pod.status else {
        return PodReadiness {
            phase: "Unknown".to_string(),
            is_ready: false,
        };
    };

    let phase = status.phase.clone().unwrap_or_else(|| "Unknown".to_string());
    let is_ready = status
        .conditions
        .iter()
        .flatten()
        .any(|condition| condition.type_ == "Ready" && condition.status == "True");
    PodReadiness { phase, is_ready }
}

/// Poll until the pod reports Ready or `timeout` elapses
pub async fn wait_for_ready(
    client: &Client,
    namespace: &str,
    app_label: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<PodReadiness> {
    let started = Instant::now();
    loop {
        let readiness = check_pod_ready(client, namespace, app_label).await?;
        debug!(phase = %readiness.phase, ready = readiness.is_ready, "Pod status");
        if readiness.is_ready {
            info!(%namespace, %app_label, elapsed = ?started.elapsed(), "Pod is ready");
            return Ok(readiness);
        }
        if started.elapsed() >= timeout {
            anyhow::bail!(
                "Pod app={} in {} not ready after {:?} (phase: {})",
                app_label,
                namespace,
                timeout,
                readiness.phase
            );
        }
        tokio::time::sleep(interval).await;
    }
}

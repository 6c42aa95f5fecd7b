// src/tracking/rest.rs
//
// =============================================================================
// RUNSCRIBE: MLFLOW REST CLIENT
// =============================================================================
//
// Talks to an MLflow tracking server (or Databricks) over the REST API 2.0.
//
// Error mapping:
// - transport failure (DNS, refused, timeout) -> Unreachable
// - 401 / 403                                 -> Configuration (credentials)
// - any other non-2xx                         -> Rejected
//
// Artifact roots:
// - `mlflow-artifacts:` -> PUT through the tracking server's artifact proxy
// - `dbfs:` (Databricks) -> ask for a signed URL per file, PUT the bytes there
// - anything else        -> Unsupported (the run itself stays usable)

use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use super::{Metric, RunInfo, RunStatus, TrackingBackend, TAG_RUN_NAME};
use crate::error::TrackingError;

const API: &str = "api/2.0/mlflow";
const ARTIFACTS_API: &str = "api/2.0/mlflow-artifacts/artifacts";
const CREDENTIALS_FOR_WRITE: &str = "artifacts/credentials-for-write";

// log-batch limits enforced by the server.
const MAX_METRICS_PER_BATCH: usize = 1000;
const MAX_PARAMS_PER_BATCH: usize = 100;
const MAX_TAGS_PER_BATCH: usize = 100;

// ============================================================================
// 1. WIRE TYPES
// ============================================================================

#[derive(Serialize)]
struct KeyValue<'a> {
    key: &'a str,
    value: &'a str,
}

fn key_values(map: &BTreeMap<String, String>) -> Vec<KeyValue<'_>> {
    map.iter()
        .map(|(k, v)| KeyValue { key: k, value: v })
        .collect()
}

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentBody,
}

#[derive(Deserialize)]
struct ExperimentBody {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunEnvelope {
    run: RunBody,
}

#[derive(Deserialize)]
struct RunBody {
    info: RunInfoBody,
}

#[derive(Deserialize)]
struct RunInfoBody {
    run_id: String,
    experiment_id: String,
    #[serde(default)]
    run_name: Option<String>,
    #[serde(default)]
    artifact_uri: String,
    #[serde(default)]
    start_time: Option<i64>,
}

#[derive(Deserialize)]
struct CredentialsResponse {
    #[serde(default)]
    credential_infos: Vec<CredentialInfo>,
}

#[derive(Deserialize)]
struct CredentialInfo {
    signed_uri: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    headers: Vec<HttpHeader>,
}

#[derive(Deserialize)]
struct HttpHeader {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: String,
}

// ============================================================================
// 2. THE CLIENT
// ============================================================================

pub struct RestBackend {
    base_url: String,
    token: Option<String>,
    client: Client,
    // run_id -> artifact_uri
    artifact_roots: HashMap<String, String>,
}

impl RestBackend {
    pub fn new(
        base_url: String,
        token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, TrackingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TrackingError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            base_url,
            token,
            client,
            artifact_roots: HashMap::new(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}/{}", self.base_url, API, endpoint)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    /// Sends `req`, mapping failures onto the error taxonomy.
    fn send(&self, req: RequestBuilder, endpoint: &str) -> Result<String, TrackingError> {
        let response = self
            .authed(req)
            .send()
            .map_err(|source| TrackingError::Unreachable {
                uri: self.base_url.clone(),
                source,
            })?;
        let status = response.status();
        let body = response.text().unwrap_or_default();

        if status.is_success() {
            return Ok(body);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TrackingError::Configuration(format!(
                "{} refused credentials for {} ({})",
                self.base_url, endpoint, status
            )));
        }
        Err(TrackingError::Rejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    fn call<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        endpoint: &str,
    ) -> Result<T, TrackingError> {
        let body = self.send(req, endpoint)?;
        Ok(serde_json::from_str(&body)?)
    }

    fn post(&self, endpoint: &str, payload: serde_json::Value) -> Result<String, TrackingError> {
        self.send(self.client.post(self.url(endpoint)).json(&payload), endpoint)
    }

    fn log_batch(&self, run_id: &str, payload: serde_json::Value) -> Result<(), TrackingError> {
        let mut payload = payload;
        payload["run_id"] = json!(run_id);
        self.post("runs/log-batch", payload).map(|_| ())
    }

    /// Databricks: fetch a signed URL for `rel_path` below the run's
    /// artifact root, then PUT `bytes` to cloud storage directly.
    fn upload_signed(&self, run_id: &str, rel_path: &str, bytes: Vec<u8>) -> Result<(), TrackingError> {
        let req = self
            .client
            .get(self.url(CREDENTIALS_FOR_WRITE))
            .query(&[("run_id", run_id), ("path", rel_path)]);
        let creds: CredentialsResponse = self.call(req, CREDENTIALS_FOR_WRITE)?;
        let cred = creds.credential_infos.into_iter().next().ok_or_else(|| {
            TrackingError::Rejected {
                endpoint: CREDENTIALS_FOR_WRITE.to_string(),
                status: 200,
                body: format!("no credentials returned for {}", rel_path),
            }
        })?;

        // Storage URLs carry their own signature; the tracking token stays home.
        let mut req = self.client.put(&cred.signed_uri).body(bytes);
        for h in &cred.headers {
            req = req.header(h.name.as_str(), h.value.as_str());
        }
        match cred.kind.as_str() {
            "AZURE_SAS_URI" => req = req.header("x-ms-blob-type", "BlockBlob"),
            "AZURE_ADLS_GEN2_SAS_URI" => {
                return Err(TrackingError::Unsupported(format!(
                    "ADLS gen2 artifact storage for {}",
                    rel_path
                )))
            }
            _ => {}
        }

        let target = cred
            .signed_uri
            .split_once('?')
            .map(|(base, _)| base)
            .unwrap_or(cred.signed_uri.as_str())
            .to_string();
        let response = req.send().map_err(|source| TrackingError::Upload {
            target: target.clone(),
            source,
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(TrackingError::Rejected {
            endpoint: target,
            status: status.as_u16(),
            body: response.text().unwrap_or_default(),
        })
    }
}

/// Path below the artifact proxy for a run whose root is `mlflow-artifacts:/...`.
pub fn proxied_artifact_path(artifact_uri: &str) -> Option<String> {
    let rest = artifact_uri.strip_prefix("mlflow-artifacts:")?;
    // Either "mlflow-artifacts:/<path>" or "mlflow-artifacts://host/<path>".
    let path = match rest.strip_prefix("//") {
        Some(with_host) => with_host.split_once('/').map(|(_, p)| p)?,
        None => rest.trim_start_matches('/'),
    };
    Some(path.trim_end_matches('/').to_string())
}

impl TrackingBackend for RestBackend {
    fn uri(&self) -> String {
        self.base_url.clone()
    }

    fn ensure_experiment(&mut self, name: &str) -> Result<String, TrackingError> {
        let endpoint = "experiments/get-by-name";
        let req = self
            .client
            .get(self.url(endpoint))
            .query(&[("experiment_name", name)]);
        match self.call::<ExperimentEnvelope>(req, endpoint) {
            Ok(found) => return Ok(found.experiment.experiment_id),
            Err(TrackingError::Rejected { status: 404, .. }) => {}
            Err(TrackingError::Rejected { body, status, endpoint })
                if serde_json::from_str::<ErrorBody>(&body)
                    .map(|e| e.error_code == "RESOURCE_DOES_NOT_EXIST")
                    .unwrap_or(false) =>
            {
                log::debug!("{} ({}) reports no experiment named {}", endpoint, status, name);
            }
            Err(e) => return Err(e),
        }

        let endpoint = "experiments/create";
        let req = self
            .client
            .post(self.url(endpoint))
            .json(&json!({ "name": name }));
        let created: CreateExperimentResponse = self.call(req, endpoint)?;
        log::info!("Created experiment '{}' (id {}) on {}", name, created.experiment_id, self.base_url);
        Ok(created.experiment_id)
    }

    fn create_run(
        &mut self,
        experiment_id: &str,
        run_name: Option<&str>,
        start_time_ms: i64,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo, TrackingError> {
        let mut all_tags = tags.clone();
        if let Some(name) = run_name {
            all_tags.insert(TAG_RUN_NAME.into(), name.to_string());
        }
        let endpoint = "runs/create";
        let mut payload = json!({
            "experiment_id": experiment_id,
            "start_time": start_time_ms,
            "tags": key_values(&all_tags),
        });
        if let Some(name) = run_name {
            payload["run_name"] = json!(name);
        }
        let req = self.client.post(self.url(endpoint)).json(&payload);
        let created: RunEnvelope = self.call(req, endpoint)?;
        let info = created.run.info;

        self.artifact_roots
            .insert(info.run_id.clone(), info.artifact_uri.clone());
        Ok(RunInfo {
            run_id: info.run_id,
            experiment_id: info.experiment_id,
            run_name: info.run_name.or_else(|| run_name.map(str::to_string)),
            artifact_uri: info.artifact_uri,
            start_time_ms: info.start_time.unwrap_or(start_time_ms),
        })
    }

    fn set_tags(
        &mut self,
        run_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError> {
        let all = key_values(tags);
        for chunk in all.chunks(MAX_TAGS_PER_BATCH) {
            self.log_batch(run_id, json!({ "tags": chunk }))?;
        }
        Ok(())
    }

    fn log_params(
        &mut self,
        run_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError> {
        let all = key_values(params);
        for chunk in all.chunks(MAX_PARAMS_PER_BATCH) {
            self.log_batch(run_id, json!({ "params": chunk }))?;
        }
        Ok(())
    }

    fn log_metrics(&mut self, run_id: &str, metrics: &[Metric]) -> Result<(), TrackingError> {
        for chunk in metrics.chunks(MAX_METRICS_PER_BATCH) {
            self.log_batch(run_id, json!({ "metrics": chunk }))?;
        }
        Ok(())
    }

    fn log_artifact(
        &mut self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> Result<(), TrackingError> {
        let root = self
            .artifact_roots
            .get(run_id)
            .ok_or_else(|| TrackingError::UnknownRun(run_id.to_string()))?;
        let file_name = local_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TrackingError::io(
                    local_path,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file path"),
                )
            })?;

        let rel_path = match artifact_dir {
            Some(sub) => format!("{}/{}", sub.trim_matches('/'), file_name),
            None => file_name,
        };

        if let Some(base) = proxied_artifact_path(root) {
            let url = format!("{}/{}/{}/{}", self.base_url, ARTIFACTS_API, base, rel_path);
            let bytes = std::fs::read(local_path).map_err(|e| TrackingError::io(local_path, e))?;
            return self
                .send(self.client.put(url).body(bytes), "mlflow-artifacts/upload")
                .map(|_| ());
        }
        if root.starts_with("dbfs:") {
            let bytes = std::fs::read(local_path).map_err(|e| TrackingError::io(local_path, e))?;
            return self.upload_signed(run_id, &rel_path, bytes);
        }
        Err(TrackingError::Unsupported(format!(
            "artifact root {:?} is not writable through {}",
            root, self.base_url
        )))
    }

    fn end_run(
        &mut self,
        run_id: &str,
        status: RunStatus,
        end_time_ms: i64,
    ) -> Result<(), TrackingError> {
        self.post(
            "runs/update",
            json!({
                "run_id": run_id,
                "status": status.as_str(),
                "end_time": end_time_ms,
            }),
        )?;
        self.artifact_roots.remove(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxied_paths() {
        assert_eq!(
            proxied_artifact_path("mlflow-artifacts:/3/abc/artifacts").as_deref(),
            Some("3/abc/artifacts")
        );
        assert_eq!(
            proxied_artifact_path("mlflow-artifacts://tracker:5000/3/abc/artifacts/").as_deref(),
            Some("3/abc/artifacts")
        );
        assert_eq!(proxied_artifact_path("dbfs:/databricks/mlflow/3"), None);
    }

    #[test]
    fn refused_connection_is_unreachable() {
        // Port 9 (discard) is closed on CI hosts; the connect fails fast.
        let mut backend = RestBackend::new("http://127.0.0.1:9".into(), None, 2).unwrap();
        let err = backend.ensure_experiment("x").unwrap_err();
        assert!(err.is_backend_down(), "unexpected error: {err:?}");
    }
}

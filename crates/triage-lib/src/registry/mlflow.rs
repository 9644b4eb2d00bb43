//! MLflow model registry client

use super::{Classifier, LinearTextModel, ModelRegistryClient, RegisteredVersion, RegistryError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// File read when an artifact uri points at a directory
const MODEL_FILE: &str = "model.json";

#[derive(Debug, Deserialize)]
struct AliasResponse {
    model_version: ModelVersionBody,
}

#[derive(Debug, Deserialize)]
struct ModelVersionBody {
    name: String,
    version: String,
    source: String,
}

/// Registry client speaking the MLflow REST API
#[derive(Debug, Clone)]
pub struct MlflowRegistryClient {
    client: Client,
    tracking_uri: Url,
}

impl MlflowRegistryClient {
    pub fn new(tracking_uri: &str) -> Result<Self, RegistryError> {
        // A trailing slash keeps the base path when joining API routes
        let mut tracking_uri = Url::parse(tracking_uri)?;
        if !tracking_uri.path().ends_with('/') {
            let path = format!("{}/", tracking_uri.path());
            tracking_uri.set_path(&path);
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            tracking_uri,
        })
    }

    pub fn tracking_uri(&self) -> &Url {
        &self.tracking_uri
    }

    fn artifact_path(source_uri: &str) -> Result<PathBuf, RegistryError> {
        let path = if source_uri.starts_with("file:") {
            Url::parse(source_uri)?
                .to_file_path()
                .map_err(|_| RegistryError::UnsupportedUri(source_uri.to_string()))?
        } else if source_uri.contains("://") {
            return Err(RegistryError::UnsupportedUri(source_uri.to_string()));
        } else {
            PathBuf::from(source_uri)
        };
        Ok(path)
    }
}

fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[async_trait]
impl ModelRegistryClient for MlflowRegistryClient {
    async fn get_model_version_by_alias(
        &self,
        name: &str,
        alias: &str,
    ) -> Result<RegisteredVersion, RegistryError> {
        let url = self
            .tracking_uri
            .join("api/2.0/mlflow/registered-models/alias")?;

        debug!(model = %name, alias = %alias, "Resolving model alias");

        let response = self
            .client
            .get(url)
            .query(&[("name", name), ("alias", alias)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::AliasNotFound {
                name: name.to_string(),
                alias: alias.to_string(),
            });
        }

        let body: AliasResponse = response.error_for_status()?.json().await?;

        Ok(RegisteredVersion {
            name: body.model_version.name,
            version: body.model_version.version,
            source_uri: body.model_version.source,
        })
    }

    async fn load(&self, source_uri: &str) -> Result<Arc<dyn Classifier>, RegistryError> {
        let mut path = Self::artifact_path(source_uri)?;
        if tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            path.push(MODEL_FILE);
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| RegistryError::Artifact {
                path: path.clone(),
                source,
            })?;

        let model = LinearTextModel::from_json(&bytes)?;

        info!(
            path = %path.display(),
            sha256 = %compute_checksum(&bytes),
            size_bytes = bytes.len(),
            classes = model.classes().len(),
            "Loaded model artifact"
        );

        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::io::Write;

    const MODEL_JSON: &str = r#"{"classes":["Billing","Network"],"vocabulary":{"vpn":0},"coefficients":[[-1.0],[1.0]],"intercepts":[0.1,0.0]}"#;

    #[tokio::test]
    async fn test_resolves_alias() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/2.0/mlflow/registered-models/alias")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("name".into(), "category_classifier".into()),
                Matcher::UrlEncoded("alias".into(), "champion".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"model_version":{"name":"category_classifier","version":"3","source":"file:///models/cat/3","aliases":["champion"]}}"#,
            )
            .create_async()
            .await;

        let client = MlflowRegistryClient::new(&server.url()).unwrap();
        let version = client
            .get_model_version_by_alias("category_classifier", "champion")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(version.version, "3");
        assert_eq!(version.source_uri, "file:///models/cat/3");
    }

    #[tokio::test]
    async fn test_missing_alias_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/2.0/mlflow/registered-models/alias")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error_code":"RESOURCE_DOES_NOT_EXIST"}"#)
            .create_async()
            .await;

        let client = MlflowRegistryClient::new(&server.url()).unwrap();
        let err = client
            .get_model_version_by_alias("priority_classifier", "champion")
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::AliasNotFound { .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/2.0/mlflow/registered-models/alias")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = MlflowRegistryClient::new(&server.url()).unwrap();
        let err = client
            .get_model_version_by_alias("category_classifier", "champion")
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Http(_)));
    }

    #[tokio::test]
    async fn test_loads_artifact_from_directory_uri() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join(MODEL_FILE))
            .unwrap()
            .write_all(MODEL_JSON.as_bytes())
            .unwrap();

        let client = MlflowRegistryClient::new("http://localhost:5000").unwrap();
        let uri = Url::from_directory_path(dir.path()).unwrap().to_string();
        let model = client.load(&uri).await.unwrap();

        assert_eq!(model.predict("vpn").unwrap(), "Network");
    }

    #[tokio::test]
    async fn test_loads_artifact_from_plain_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MODEL_JSON.as_bytes()).unwrap();

        let client = MlflowRegistryClient::new("http://localhost:5000").unwrap();
        let model = client.load(file.path().to_str().unwrap()).await.unwrap();

        assert_eq!(model.predict("invoice").unwrap(), "Billing");
    }

    #[tokio::test]
    async fn test_rejects_remote_artifact_uri() {
        let client = MlflowRegistryClient::new("http://localhost:5000").unwrap();
        let Err(err) = client.load("s3://bucket/models/3").await else {
            panic!("remote artifact URI should be rejected");
        };
        assert!(matches!(err, RegistryError::UnsupportedUri(_)));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = MlflowRegistryClient::new("http://localhost:5000").unwrap();
        let Err(err) = client
            .load(dir.path().join("absent.json").to_str().unwrap())
            .await
        else {
            panic!("missing artifact should fail to load");
        };
        assert!(matches!(err, RegistryError::Artifact { .. }));
    }

    #[test]
    fn test_tracking_uri_keeps_base_path() {
        let client = MlflowRegistryClient::new("http://mlflow:5000/prefix").unwrap();
        assert_eq!(client.tracking_uri().as_str(), "http://mlflow:5000/prefix/");
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(compute_checksum(b"model"), compute_checksum(b"model"));
        assert_ne!(compute_checksum(b"model"), compute_checksum(b"model2"));
    }
}

//! レジストリ上のイメージ（読み取り専用）
//!
//! Registry v2 API でマニフェストと config を取得し、ラベルと環境変数を
//! 参照できるようにします。401 の場合は WWW-Authenticate のチャレンジに
//! 従って bearer トークンを取得して再試行します。

use super::{Image, lookup_env};
use crate::auth::RegistryAuth;
use crate::error::{BuildError, BuildResult};
use crate::reference::{DEFAULT_REGISTRY, ImageRef};
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const DOCKER_REGISTRY_URL: &str = "https://registry-1.docker.io";

const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    config: Option<Descriptor>,
    /// マニフェストリスト（マルチプラットフォーム）の場合のみ
    #[serde(default)]
    manifests: Vec<PlatformDescriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct PlatformDescriptor {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: ContainerConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Default)]
struct AuthChallenge {
    realm: String,
    service: String,
    scope: String,
}

/// レジストリ上のイメージ
#[derive(Debug, Clone)]
pub struct RemoteImage {
    name: String,
    labels: HashMap<String, String>,
    env: Vec<String>,
    exposed_ports: Vec<String>,
}

impl RemoteImage {
    /// レジストリからイメージの設定を取得
    pub async fn fetch(name: &str, auth: &RegistryAuth) -> BuildResult<Self> {
        let reference = ImageRef::parse(name)?;
        let credentials = auth.registry_credentials(reference.registry())?;
        let client = RegistryClient {
            client: Client::builder()
                .user_agent(concat!("cnbpack/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| registry_error(name, e))?,
            base_url: registry_url(reference.registry()),
            image: name.to_string(),
            credentials: credentials.and_then(|c| c.username.zip(c.password)),
            token: None,
        };
        client.fetch_image(&reference).await
    }

    pub fn exposed_ports(&self) -> &[String] {
        &self.exposed_ports
    }
}

struct RegistryClient {
    client: Client,
    base_url: String,
    image: String,
    credentials: Option<(String, String)>,
    token: Option<String>,
}

impl RegistryClient {
    async fn fetch_image(mut self, reference: &ImageRef) -> BuildResult<RemoteImage> {
        let repository = reference.repository();
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url,
            repository,
            reference.identifier()
        );
        let mut manifest: Manifest = self.get_json(&url).await?;

        if !manifest.manifests.is_empty() {
            let digest = select_platform(&manifest.manifests)
                .map(str::to_string)
                .ok_or_else(|| BuildError::RegistryFailed {
                    image: self.image.clone(),
                    message: "manifest list is empty".to_string(),
                })?;
            let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, digest);
            manifest = self.get_json(&url).await?;
        }

        let config_digest = manifest
            .config
            .ok_or_else(|| BuildError::RegistryFailed {
                image: self.image.clone(),
                message: "manifest has no config".to_string(),
            })?
            .digest;
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repository, config_digest);
        let blob: ConfigBlob = self.get_json(&url).await?;

        Ok(RemoteImage {
            name: self.image,
            labels: blob.config.labels.unwrap_or_default(),
            env: blob.config.env.unwrap_or_default(),
            exposed_ports: blob
                .config
                .exposed_ports
                .map(|ports| ports.into_keys().collect())
                .unwrap_or_default(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&mut self, url: &str) -> BuildResult<T> {
        tracing::debug!("GET {}", url);
        let mut response = self.send(url).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = parse_www_authenticate(&response).ok_or_else(|| {
                BuildError::AuthFailed {
                    registry: self.base_url.clone(),
                    message: "invalid WWW-Authenticate header".to_string(),
                }
            })?;
            self.token = Some(self.get_token(&challenge).await?);
            response = self.send(url).await?;
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BuildError::ImageNotFound {
                image: self.image.clone(),
                location: "in registry".to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BuildError::RegistryFailed {
                image: self.image.clone(),
                message: format!("{} - {}", status, body),
            });
        }

        response
            .json()
            .await
            .map_err(|e| registry_error(&self.image, e))
    }

    async fn send(&self, url: &str) -> BuildResult<reqwest::Response> {
        let mut request = self
            .client
            .get(url)
            .header(header::ACCEPT, ACCEPT_MANIFEST);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|e| registry_error(&self.image, e))
    }

    async fn get_token(&self, challenge: &AuthChallenge) -> BuildResult<String> {
        let auth_failed = |message: String| BuildError::AuthFailed {
            registry: challenge.service.clone(),
            message,
        };

        let mut request = self.client.get(&challenge.realm).query(&[
            ("service", challenge.service.as_str()),
            ("scope", challenge.scope.as_str()),
        ]);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| auth_failed(format!("token request failed: {}", e)))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_failed(format!("token request failed: {}", body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_failed(format!("failed to parse token response: {}", e)))?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| auth_failed("token response has no token".to_string()))
    }
}

fn registry_error(image: &str, e: reqwest::Error) -> BuildError {
    BuildError::RegistryFailed {
        image: image.to_string(),
        message: e.to_string(),
    }
}

fn registry_url(registry: &str) -> String {
    if registry == DEFAULT_REGISTRY {
        return DOCKER_REGISTRY_URL.to_string();
    }
    if registry.starts_with("localhost") || registry.starts_with("127.0.0.1") {
        return format!("http://{}", registry);
    }
    format!("https://{}", registry)
}

/// linux/amd64 を優先し、なければ最初のマニフェスト
fn select_platform(manifests: &[PlatformDescriptor]) -> Option<&str> {
    manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
        })
        .or_else(|| manifests.first())
        .map(|m| m.digest.as_str())
}

/// `Bearer realm="...",service="...",scope="..."` を解析
fn parse_www_authenticate(response: &reqwest::Response) -> Option<AuthChallenge> {
    let value = response
        .headers()
        .get(header::WWW_AUTHENTICATE)?
        .to_str()
        .ok()?;
    parse_challenge(value)
}

fn parse_challenge(value: &str) -> Option<AuthChallenge> {
    let mut challenge = AuthChallenge::default();
    for part in value.trim_start_matches("Bearer ").split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("realm=") {
            challenge.realm = v.trim_matches('"').to_string();
        } else if let Some(v) = part.strip_prefix("service=") {
            challenge.service = v.trim_matches('"').to_string();
        } else if let Some(v) = part.strip_prefix("scope=") {
            challenge.scope = v.trim_matches('"').to_string();
        }
    }
    (!challenge.realm.is_empty()).then_some(challenge)
}

impl Image for RemoteImage {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn label(&self, key: &str) -> BuildResult<Option<String>> {
        Ok(self.labels.get(key).cloned())
    }

    fn set_label(&mut self, _key: &str, _value: &str) -> BuildResult<()> {
        Err(BuildError::ReadOnlyImage(self.name.clone()))
    }

    fn env(&self, key: &str) -> BuildResult<Option<String>> {
        Ok(lookup_env(&self.env, key))
    }

    fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn add_layer(&mut self, _tar_path: &Path) -> BuildResult<()> {
        Err(BuildError::ReadOnlyImage(self.name.clone()))
    }

    async fn save(&mut self) -> BuildResult<String> {
        Err(BuildError::ReadOnlyImage(self.name.clone()))
    }

    async fn delete(&self) -> BuildResult<()> {
        Err(BuildError::ReadOnlyImage(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service, "registry.docker.io");
        assert_eq!(challenge.scope, "repository:library/alpine:pull");

        assert!(parse_challenge("Basic charset=\"UTF-8\"").is_none());
    }

    #[test]
    fn test_registry_url() {
        assert_eq!(registry_url("index.docker.io"), "https://registry-1.docker.io");
        assert_eq!(registry_url("ghcr.io"), "https://ghcr.io");
        assert_eq!(registry_url("localhost:5000"), "http://localhost:5000");
    }

    #[test]
    fn test_select_platform_prefers_linux_amd64() {
        let manifests: Vec<PlatformDescriptor> = serde_json::from_str(
            r#"[
                {"digest": "sha256:arm", "platform": {"os": "linux", "architecture": "arm64"}},
                {"digest": "sha256:amd", "platform": {"os": "linux", "architecture": "amd64"}}
            ]"#,
        )
        .unwrap();
        assert_eq!(select_platform(&manifests), Some("sha256:amd"));
        assert_eq!(select_platform(&manifests[..1]), Some("sha256:arm"));
        assert_eq!(select_platform(&[]), None);
    }

    #[test]
    fn test_config_blob_labels() {
        let blob: ConfigBlob = serde_json::from_str(
            r#"{"config": {"Labels": {"io.buildpacks.stack.id": "some.stack.id"}, "Env": ["CNB_USER_ID=1000"], "ExposedPorts": {"8080/tcp": {}}}}"#,
        )
        .unwrap();
        assert_eq!(
            blob.config.labels.unwrap()["io.buildpacks.stack.id"],
            "some.stack.id"
        );
        assert_eq!(blob.config.env.unwrap(), vec!["CNB_USER_ID=1000"]);
    }

    #[tokio::test]
    async fn test_remote_image_is_read_only() {
        let mut image = RemoteImage {
            name: "some/run".to_string(),
            labels: HashMap::new(),
            env: Vec::new(),
            exposed_ports: Vec::new(),
        };
        assert!(matches!(
            image.set_label("a", "b"),
            Err(BuildError::ReadOnlyImage(_))
        ));
        assert!(image.save().await.is_err());
        assert!(image.delete().await.is_err());
    }
}

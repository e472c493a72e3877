//! スタック情報とランイメージのミラー選択

use crate::error::{BuildError, BuildResult};
use crate::reference::registry_of;
use serde::{Deserialize, Serialize};

/// スタックIDを保持するラベル
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMetadata {
    #[serde(default, rename = "runImage")]
    pub run_image: RunImageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

/// `/buildpacks/stack.toml` の内容
#[derive(Debug, Serialize)]
struct StackToml<'a> {
    #[serde(rename = "run-image")]
    run_image: &'a str,
    #[serde(rename = "run-image-mirrors")]
    run_image_mirrors: &'a [String],
}

impl StackMetadata {
    /// 対象レジストリに最適なランイメージを選択
    ///
    /// 候補はローカルミラー、プライマリ、ビルダーのミラーの順。
    /// レジストリが一致する最初の候補を返し、なければ
    /// 最初のローカルミラー、それもなければプライマリを返す。
    pub fn best_mirror(&self, registry: &str, local_mirrors: &[String]) -> String {
        let candidates = local_mirrors
            .iter()
            .chain(std::iter::once(&self.run_image.image))
            .chain(self.run_image.mirrors.iter());

        for candidate in candidates {
            match registry_of(candidate) {
                Some(host) if host == registry => return candidate.clone(),
                Some(_) => {}
                None => tracing::debug!("Skipping unparsable run-image mirror '{}'", candidate),
            }
        }

        local_mirrors
            .first()
            .cloned()
            .unwrap_or_else(|| self.run_image.image.clone())
    }

    pub fn encode_toml(&self) -> BuildResult<String> {
        toml::to_string(&StackToml {
            run_image: &self.run_image.image,
            run_image_mirrors: &self.run_image.mirrors,
        })
        .map_err(|e| BuildError::EncodeFailed {
            document: "stack.toml".to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> StackMetadata {
        StackMetadata {
            run_image: RunImageMetadata {
                image: "default/run".to_string(),
                mirrors: vec![
                    "registry1.example.com/run/mirror".to_string(),
                    "registry2.example.com/run/mirror".to_string(),
                ],
            },
        }
    }

    #[test]
    fn test_best_mirror_builder_mirrors_only() {
        let stack = stack();
        let cases = [
            ("index.docker.io", "default/run"),
            ("registry1.example.com", "registry1.example.com/run/mirror"),
            ("registry2.example.com", "registry2.example.com/run/mirror"),
            ("registry3.example.com", "default/run"),
        ];
        for (registry, expected) in cases {
            assert_eq!(stack.best_mirror(registry, &[]), expected, "registry {}", registry);
        }
    }

    #[test]
    fn test_best_mirror_prefers_local_mirrors() {
        let stack = stack();
        let local = vec![
            "local/mirror".to_string(),
            "registry1.example.com/local/mirror".to_string(),
        ];
        let cases = [
            ("index.docker.io", "local/mirror"),
            ("registry1.example.com", "registry1.example.com/local/mirror"),
            ("registry2.example.com", "registry2.example.com/run/mirror"),
            ("registry3.example.com", "local/mirror"),
        ];
        for (registry, expected) in cases {
            assert_eq!(stack.best_mirror(registry, &local), expected, "registry {}", registry);
        }
    }

    #[test]
    fn test_best_mirror_skips_unparsable() {
        let stack = StackMetadata {
            run_image: RunImageMetadata {
                image: "default/run".to_string(),
                mirrors: vec!["not@valid".to_string(), "example.com/run".to_string()],
            },
        };
        assert_eq!(stack.best_mirror("example.com", &[]), "example.com/run");
    }

    #[test]
    fn test_encode_stack_toml() {
        let encoded = stack().encode_toml().unwrap();
        let value: toml::Value = toml::from_str(&encoded).unwrap();
        assert_eq!(value["run-image"].as_str(), Some("default/run"));
        let mirrors = value["run-image-mirrors"].as_array().unwrap();
        assert_eq!(mirrors.len(), 2);
        assert_eq!(mirrors[1].as_str(), Some("registry2.example.com/run/mirror"));
    }
}

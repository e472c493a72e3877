//! ビルダーメタデータ（`io.buildpacks.builder.metadata` ラベル）

use crate::error::{BuildError, BuildResult};
use crate::stack::StackMetadata;
use serde::{Deserialize, Serialize};

/// ビルダーメタデータを保持するラベル
pub const METADATA_LABEL: &str = "io.buildpacks.builder.metadata";

/// ビルダーイメージに埋め込まれるメタデータ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderMetadata {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackMetadata>,
    #[serde(default)]
    pub groups: Vec<GroupMetadata>,
    #[serde(default)]
    pub stack: StackMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackMetadata {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub latest: bool,
}

/// order.toml の1グループ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    #[serde(default)]
    pub buildpacks: Vec<GroupBuildpack>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBuildpack {
    pub id: String,
    pub version: String,
}

impl GroupBuildpack {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

/// `/buildpacks/order.toml` の内容
#[derive(Debug, Serialize)]
struct OrderToml<'a> {
    groups: &'a [GroupMetadata],
}

impl BuilderMetadata {
    pub fn encode(&self) -> BuildResult<String> {
        serde_json::to_string(self).map_err(|e| BuildError::EncodeFailed {
            document: "builder metadata".to_string(),
            message: e.to_string(),
        })
    }

    /// ラベル値をデコード
    ///
    /// `image` はエラーメッセージ用
    pub fn decode(image: &str, value: &str) -> BuildResult<Self> {
        serde_json::from_str(value).map_err(|source| BuildError::MalformedMetadata {
            image: image.to_string(),
            source,
        })
    }
}

/// order.toml 用の TOML 文字列を生成
pub fn encode_order(groups: &[GroupMetadata]) -> BuildResult<String> {
    toml::to_string(&OrderToml { groups }).map_err(|e| BuildError::EncodeFailed {
        document: "order.toml".to_string(),
        message: e.to_string(),
    })
}

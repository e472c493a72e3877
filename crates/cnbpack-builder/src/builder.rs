//! ビルダーイメージ
//!
//! ベースとなるビルダーイメージにbuildpack・order・stack・環境変数の
//! レイヤーを重ね、メタデータラベルを更新した新しいイメージを作ります。
//! 元のイメージのファイルシステムは変更しません。

use crate::buildpack::Buildpack;
use crate::error::{BuildError, BuildResult};
use crate::image::Image;
use crate::layer::LayerFactory;
use crate::metadata::{BuilderMetadata, BuildpackMetadata, GroupMetadata, METADATA_LABEL};
use crate::stack::{RunImageMetadata, STACK_ID_LABEL, StackMetadata};
use std::collections::BTreeMap;
use std::path::Path;

/// ビルダーのユーザーID を保持する環境変数
pub const ENV_UID: &str = "CNB_USER_ID";
/// ビルダーのグループID を保持する環境変数
pub const ENV_GID: &str = "CNB_GROUP_ID";

pub struct Builder<I> {
    image: I,
    /// `save` で追加する buildpack
    buildpacks: Vec<Buildpack>,
    metadata: BuilderMetadata,
    env: BTreeMap<String, String>,
    uid: u32,
    gid: u32,
    stack_id: String,
}

impl<I: Image> Builder<I> {
    /// 既存のビルダーイメージを開く
    ///
    /// メタデータラベルが必須
    pub fn open(image: I) -> BuildResult<Self> {
        let (uid, gid) = user_and_group_ids(&image)?;
        let stack_id = stack_id(&image)?;

        let label = image
            .label(METADATA_LABEL)?
            .filter(|l| !l.is_empty())
            .ok_or_else(|| BuildError::MissingMetadata {
                image: image.name(),
                label: METADATA_LABEL.to_string(),
            })?;
        let metadata = BuilderMetadata::decode(&image.name(), &label)?;

        Ok(Self {
            image,
            buildpacks: Vec::new(),
            metadata,
            env: BTreeMap::new(),
            uid,
            gid,
            stack_id,
        })
    }

    /// ベースイメージを `name` にリネームした一時ビルダーを作る
    ///
    /// メタデータラベルがなければ空のメタデータから始める
    pub fn new(mut image: I, name: &str) -> BuildResult<Self> {
        let (uid, gid) = user_and_group_ids(&image)?;
        let stack_id = stack_id(&image)?;

        let metadata = match image.label(METADATA_LABEL)? {
            Some(label) if !label.is_empty() => BuilderMetadata::decode(&image.name(), &label)?,
            _ => BuilderMetadata::default(),
        };

        tracing::debug!("Creating builder {} from {}", name, image.name());
        image.rename(name);

        Ok(Self {
            image,
            buildpacks: Vec::new(),
            metadata,
            env: BTreeMap::new(),
            uid,
            gid,
            stack_id,
        })
    }

    /// buildpack を追加（ビルダーのスタックをサポートしている必要がある）
    pub fn add_buildpack(&mut self, bp: Buildpack) -> BuildResult<()> {
        if !bp.supports_stack(&self.stack_id) {
            return Err(BuildError::UnsupportedStack {
                id: bp.id,
                version: bp.version,
                stack: self.stack_id.clone(),
            });
        }

        self.metadata.buildpacks.push(BuildpackMetadata {
            id: bp.id.clone(),
            version: bp.version.clone(),
            latest: bp.latest,
        });
        self.buildpacks.push(bp);
        Ok(())
    }

    pub fn set_order(&mut self, groups: Vec<GroupMetadata>) {
        self.metadata.groups = groups;
    }

    pub fn set_env(&mut self, env: BTreeMap<String, String>) {
        self.env = env;
    }

    pub fn set_stack_info(&mut self, run_image: &str, mirrors: Vec<String>) {
        self.metadata.stack = StackMetadata {
            run_image: RunImageMetadata {
                image: run_image.to_string(),
                mirrors,
            },
        };
    }

    /// レイヤーとメタデータをイメージに書き込み、保存する
    ///
    /// レイヤーは env、buildpack（追加順）、order、stack の順に追加される
    pub async fn save(&mut self) -> BuildResult<String> {
        let scratch = tempfile::Builder::new()
            .prefix("create-builder-scratch")
            .tempdir()?;
        let factory = LayerFactory::new(scratch.path(), self.uid, self.gid);

        let env_tar = factory.env_layer(&self.env)?;
        self.add_layer(&env_tar, "env")?;

        for bp in &self.buildpacks {
            let layer_tar = factory.buildpack_layer(bp)?;
            add_layer(
                &mut self.image,
                &layer_tar,
                &format!("buildpack '{}@{}'", bp.id, bp.version),
            )?;
        }

        let order_tar = factory.order_layer(&self.metadata.groups)?;
        self.add_layer(&order_tar, "order")?;

        let stack_tar = factory.stack_layer(&self.metadata.stack)?;
        self.add_layer(&stack_tar, "stack")?;

        let label = self.metadata.encode()?;
        self.image.set_label(METADATA_LABEL, &label)?;

        self.image.save().await
    }

    fn add_layer(&mut self, tar_path: &Path, artifact: &str) -> BuildResult<()> {
        add_layer(&mut self.image, tar_path, artifact)
    }

    /// buildpack のメタデータを取得
    ///
    /// `version` が `latest` の場合は latest フラグの付いたものを返す
    pub fn get_buildpack(&self, id: &str, version: &str) -> Option<&BuildpackMetadata> {
        if version != "latest" {
            return self
                .metadata
                .buildpacks
                .iter()
                .find(|bp| bp.id == id && bp.version == version);
        }

        let mut latest = self
            .metadata
            .buildpacks
            .iter()
            .filter(|bp| bp.id == id && bp.latest);
        let first = latest.next();
        if first.is_some() && latest.next().is_some() {
            tracing::warn!(
                "Multiple buildpacks '{}' are marked latest, using version {}",
                id,
                first.map(|bp| bp.version.as_str()).unwrap_or_default()
            );
        }
        first
    }

    pub fn name(&self) -> String {
        self.image.name()
    }

    pub fn buildpacks(&self) -> &[BuildpackMetadata] {
        &self.metadata.buildpacks
    }

    pub fn order(&self) -> &[GroupMetadata] {
        &self.metadata.groups
    }

    pub fn stack_info(&self) -> &StackMetadata {
        &self.metadata.stack
    }

    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn image(&self) -> &I {
        &self.image
    }

    pub fn into_image(self) -> I {
        self.image
    }
}

fn add_layer<I: Image>(image: &mut I, tar_path: &Path, artifact: &str) -> BuildResult<()> {
    image.add_layer(tar_path).map_err(|e| match e {
        BuildError::AddLayerFailed { message, .. } => BuildError::AddLayerFailed {
            artifact: artifact.to_string(),
            message,
        },
        other => BuildError::AddLayerFailed {
            artifact: artifact.to_string(),
            message: other.to_string(),
        },
    })
}

fn user_and_group_ids<I: Image>(image: &I) -> BuildResult<(u32, u32)> {
    Ok((
        required_id(image, ENV_UID)?,
        required_id(image, ENV_GID)?,
    ))
}

fn required_id<I: Image>(image: &I, key: &str) -> BuildResult<u32> {
    let value = image
        .env(key)?
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BuildError::MissingEnv {
            image: image.name(),
            key: key.to_string(),
        })?;
    value.trim().parse().map_err(|_| BuildError::InvalidEnv {
        key: key.to_string(),
        value,
    })
}

fn stack_id<I: Image>(image: &I) -> BuildResult<String> {
    image
        .label(STACK_ID_LABEL)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BuildError::MissingLabel {
            image: image.name(),
            label: STACK_ID_LABEL.to_string(),
        })
}

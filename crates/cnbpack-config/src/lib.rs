pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 設定ディレクトリを上書きする環境変数
pub const PACK_HOME_ENV: &str = "PACK_HOME";

/// クライアント設定（~/.pack/config.toml）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// `--builder` 未指定時に使うビルダーイメージ
    #[serde(default, rename = "default-builder-image", skip_serializing_if = "Option::is_none")]
    pub default_builder: Option<String>,

    /// ランイメージごとのローカルミラー設定
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_images: Vec<RunImageConfig>,
}

/// ランイメージとそのローカルミラー
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageConfig {
    pub image: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl Config {
    /// 設定ファイルを読み込む
    ///
    /// ファイルが存在しない場合はデフォルト設定を返す
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 設定ファイルを書き込む（親ディレクトリがなければ作成）
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 指定したランイメージのローカル設定を取得
    pub fn run_image(&self, image: &str) -> Option<&RunImageConfig> {
        self.run_images.iter().find(|r| r.image == image)
    }

    /// ランイメージのローカルミラーを設定（既存エントリは置き換え）
    pub fn set_run_image_mirrors(&mut self, image: &str, mirrors: Vec<String>) {
        match self.run_images.iter_mut().find(|r| r.image == image) {
            Some(existing) => existing.mirrors = mirrors,
            None => self.run_images.push(RunImageConfig {
                image: image.to_string(),
                mirrors,
            }),
        }
    }

    pub fn set_default_builder(&mut self, builder: &str) {
        self.default_builder = Some(builder.to_string());
    }
}

/// 設定ディレクトリを取得
///
/// 優先順位:
/// 1. 環境変数 PACK_HOME
/// 2. ~/.pack
pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(PACK_HOME_ENV)
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }

    dirs::home_dir()
        .map(|home| home.join(".pack"))
        .ok_or(ConfigError::HomeDirNotFound)
}

/// デフォルトの設定ファイルパス
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_load_missing_file_returns_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config::load(&temp_dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_config_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
default-builder-image = "example.com/default/builder:tag"

[[run-images]]
image = "default/run"
mirrors = ["local/mirror", "registry1.example.com/local/mirror"]
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.default_builder.as_deref(),
            Some("example.com/default/builder:tag")
        );
        let run_image = config.run_image("default/run").unwrap();
        assert_eq!(
            run_image.mirrors,
            vec!["local/mirror", "registry1.example.com/local/mirror"]
        );
        assert!(config.run_image("other/run").is_none());
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "default-builder-image = [").unwrap();

        match Config::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set_default_builder("some/builder");
        config.set_run_image_mirrors("default/run", vec!["local/mirror".to_string()]);
        config.write(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_set_run_image_mirrors_replaces_existing() {
        let mut config = Config::default();
        config.set_run_image_mirrors("default/run", vec!["a/mirror".to_string()]);
        config.set_run_image_mirrors("default/run", vec!["b/mirror".to_string()]);

        assert_eq!(config.run_images.len(), 1);
        assert_eq!(config.run_images[0].mirrors, vec!["b/mirror"]);
    }

    #[test]
    #[serial]
    fn test_config_dir_from_pack_home() {
        let temp_dir = tempfile::tempdir().unwrap();
        temp_env::with_var(PACK_HOME_ENV, Some(temp_dir.path()), || {
            let path = default_config_path().unwrap();
            assert_eq!(path, temp_dir.path().join("config.toml"));
        });
    }

    #[test]
    #[serial]
    fn test_config_dir_defaults_to_home() {
        temp_env::with_var_unset(PACK_HOME_ENV, || {
            if let Some(home) = dirs::home_dir() {
                assert_eq!(get_config_dir().unwrap(), home.join(".pack"));
            }
        });
    }
}

//! メモリ上のイメージ（テストおよびドライラン用）

use super::{Image, lookup_env};
use crate::error::{BuildError, BuildResult};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    name: String,
    labels: BTreeMap<String, String>,
    env: Vec<String>,
    layers: Vec<Vec<u8>>,
    exposed_ports: Vec<String>,
    saved: bool,
    deleted: bool,
    /// 設定されていれば `delete` はこのメッセージで失敗する
    delete_error: Option<String>,
}

/// メモリ上で変更を記録するイメージ
///
/// クローンは状態を共有するので、ビルダーに渡した後でも
/// 追加されたレイヤーや保存状態を確認できる
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    state: Arc<Mutex<State>>,
}

impl MemoryImage {
    pub fn new(name: &str) -> Self {
        let image = Self::default();
        image.state().name = name.to_string();
        image
    }

    pub fn with_label(self, key: &str, value: &str) -> Self {
        self.state()
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_env(self, key: &str, value: &str) -> Self {
        self.set_env(key, value);
        self
    }

    pub fn with_exposed_port(self, port: &str) -> Self {
        self.state().exposed_ports.push(port.to_string());
        self
    }

    /// `delete` を Docker の競合エラーで失敗させる
    pub fn with_delete_error(self, message: &str) -> Self {
        self.state().delete_error = Some(message.to_string());
        self
    }

    pub fn set_env(&self, key: &str, value: &str) {
        let mut state = self.state();
        state
            .env
            .retain(|entry| entry.split_once('=').map(|(k, _)| k) != Some(key));
        state.env.push(format!("{}={}", key, value));
    }

    pub fn exposed_ports(&self) -> Vec<String> {
        self.state().exposed_ports.clone()
    }

    pub fn layers(&self) -> Vec<Vec<u8>> {
        self.state().layers.clone()
    }

    pub fn layer_count(&self) -> usize {
        self.state().layers.len()
    }

    /// 指定パスのエントリを含む最初のレイヤーを返す
    ///
    /// パス先頭の `/` は無視する
    pub fn find_layer_with_path(&self, path: &str) -> Option<Vec<u8>> {
        let wanted = path.trim_start_matches('/');
        self.state()
            .layers
            .iter()
            .find(|layer| layer_contains(layer, wanted))
            .cloned()
    }

    /// 指定パスのファイル内容（最後に追加されたレイヤーを優先）
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        let wanted = path.trim_start_matches('/');
        self.state()
            .layers
            .iter()
            .rev()
            .find_map(|layer| read_entry(layer, wanted))
    }

    pub fn is_saved(&self) -> bool {
        self.state().saved
    }

    pub fn is_deleted(&self) -> bool {
        self.state().deleted
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy()
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

fn layer_contains(layer: &[u8], wanted: &str) -> bool {
    let mut archive = tar::Archive::new(layer);
    let Ok(entries) = archive.entries() else {
        return false;
    };
    entries
        .filter_map(|e| e.ok())
        .any(|e| e.path().map(|p| normalize(&p) == wanted).unwrap_or(false))
}

fn read_entry(layer: &[u8], wanted: &str) -> Option<Vec<u8>> {
    let mut archive = tar::Archive::new(layer);
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if entry.path().map(|p| normalize(&p) == wanted).unwrap_or(false) {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).ok()?;
            return Some(content);
        }
    }
    None
}

impl Image for MemoryImage {
    fn name(&self) -> String {
        self.state().name.clone()
    }

    fn label(&self, key: &str) -> BuildResult<Option<String>> {
        Ok(self.state().labels.get(key).cloned())
    }

    fn set_label(&mut self, key: &str, value: &str) -> BuildResult<()> {
        self.state()
            .labels
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn env(&self, key: &str) -> BuildResult<Option<String>> {
        Ok(lookup_env(&self.state().env, key))
    }

    fn rename(&mut self, name: &str) {
        self.state().name = name.to_string();
    }

    fn add_layer(&mut self, tar_path: &Path) -> BuildResult<()> {
        let data = std::fs::read(tar_path).map_err(|e| BuildError::AddLayerFailed {
            artifact: tar_path.display().to_string(),
            message: e.to_string(),
        })?;
        self.state().layers.push(data);
        Ok(())
    }

    async fn save(&mut self) -> BuildResult<String> {
        let mut state = self.state();
        state.saved = true;
        Ok(format!("sha256:memory-{}", state.layers.len()))
    }

    async fn delete(&self) -> BuildResult<()> {
        let mut state = self.state();
        if let Some(message) = &state.delete_error {
            return Err(BuildError::DockerConnection(
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409,
                    message: message.clone(),
                },
            ));
        }
        if state.deleted {
            return Err(BuildError::ImageNotFound {
                image: state.name.clone(),
                location: "in memory".to_string(),
            });
        }
        state.deleted = true;
        Ok(())
    }
}

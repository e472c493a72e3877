//! メモリ上のコンテナランタイム（テスト用）
//!
//! ボリュームをパスとファイルの対応表として保持し、コンテナの実行は
//! 登録したハンドラで置き換えます。

use crate::error::{ContainerError, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// ボリューム上のファイル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFile {
    pub content: Vec<u8>,
    pub uid: u64,
    pub gid: u64,
}

/// コンテナから見たファイルシステム
///
/// マウントされたボリュームへの読み書きのみを扱う
pub struct ContainerFs<'a> {
    /// (コンテナ内のパス, ボリューム名)
    mounts: Vec<(String, String)>,
    volumes: &'a mut HashMap<String, BTreeMap<String, VolumeFile>>,
}

impl ContainerFs<'_> {
    fn resolve(&self, path: &str) -> Option<(String, String)> {
        self.mounts.iter().find_map(|(target, volume)| {
            let rest = path.strip_prefix(target.as_str())?;
            let rest = rest.strip_prefix('/')?;
            (!rest.is_empty()).then(|| (volume.clone(), rest.to_string()))
        })
    }

    pub fn read(&self, path: &str) -> Option<&VolumeFile> {
        let (volume, rel) = self.resolve(path)?;
        self.volumes.get(&volume)?.get(&rel)
    }

    /// マウント外のパスへの書き込みは false
    pub fn write(&mut self, path: &str, content: &[u8]) -> bool {
        let Some((volume, rel)) = self.resolve(path) else {
            return false;
        };
        match self.volumes.get_mut(&volume) {
            Some(files) => {
                files.insert(
                    rel,
                    VolumeFile {
                        content: content.to_vec(),
                        uid: 0,
                        gid: 0,
                    },
                );
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, path: &str) -> bool {
        let Some((volume, rel)) = self.resolve(path) else {
            return false;
        };
        self.volumes
            .get_mut(&volume)
            .is_some_and(|files| files.remove(&rel).is_some())
    }
}

/// コンテナの振る舞い（終了コードを返す）
pub type Handler =
    Arc<dyn Fn(&ContainerSpec, &mut ContainerFs<'_>, &mut dyn Write) -> i64 + Send + Sync>;

#[derive(Default)]
struct State {
    volumes: HashMap<String, BTreeMap<String, VolumeFile>>,
    containers: HashMap<String, ContainerSpec>,
    images: Vec<String>,
    exposed_ports: HashMap<String, Vec<String>>,
    created: Vec<ContainerSpec>,
    removed_containers: Vec<String>,
    removed_images: Vec<String>,
    /// 削除に失敗するボリューム
    failing_volumes: Vec<String>,
    /// 失敗させる残りのコピー回数
    failing_copies: usize,
    next_id: usize,
}

/// メモリ上で動作する ContainerRuntime
///
/// クローンは状態を共有する
#[derive(Clone)]
pub struct MemoryRuntime {
    state: Arc<Mutex<State>>,
    handler: Handler,
    /// このコマンド（cmd がなければイメージ名）のコンテナは終了しない
    hang_on: Option<String>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    /// 何も出力せず終了コード 0 を返すランタイム
    pub fn new() -> Self {
        Self::with_handler(|_, _, _| 0)
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ContainerSpec, &mut ContainerFs<'_>, &mut dyn Write) -> i64 + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            handler: Arc::new(handler),
            hang_on: None,
        }
    }

    /// `cmd` の先頭（なければイメージ名）が `command` のコンテナは、
    /// キャンセルされるまで終了しない
    pub fn hang_on(mut self, command: &str) -> Self {
        self.hang_on = Some(command.to_string());
        self
    }

    /// 削除可能なイメージを登録
    pub fn with_image(self, name: &str, exposed_ports: &[&str]) -> Self {
        {
            let mut state = self.state();
            state.images.push(name.to_string());
            state.exposed_ports.insert(
                name.to_string(),
                exposed_ports.iter().map(|p| p.to_string()).collect(),
            );
        }
        self
    }

    /// `name` ボリュームの削除を常に失敗させる
    pub fn fail_remove_volume(self, name: &str) -> Self {
        self.state().failing_volumes.push(name.to_string());
        self
    }

    /// 次の `count` 回のコンテナへのコピーを失敗させる
    pub fn fail_copies(self, count: usize) -> Self {
        self.state().failing_copies = count;
        self
    }

    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn volume_file(&self, volume: &str, path: &str) -> Option<VolumeFile> {
        self.state().volumes.get(volume)?.get(path).cloned()
    }

    /// 作成されたコンテナの設定（作成順）
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state().created.clone()
    }

    /// 削除されていないコンテナの数
    pub fn live_containers(&self) -> usize {
        self.state().containers.len()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state().removed_containers.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ContainerRuntime for MemoryRuntime {
    async fn create_volume(&self, name: &str) -> Result<()> {
        self.state()
            .volumes
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.failing_volumes.iter().any(|v| v == name) {
            return Err(ContainerError::DockerApiError(format!(
                "volume {} is in use",
                name
            )));
        }
        match state.volumes.remove(name) {
            Some(_) => Ok(()),
            None => Err(ContainerError::NotFound {
                kind: "volume",
                name: name.to_string(),
            }),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(id.clone(), spec.clone());
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn copy_to_container(&self, id: &str, dest: &str, archive: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        if state.failing_copies > 0 {
            state.failing_copies -= 1;
            return Err(ContainerError::DockerApiError(format!(
                "failed to copy archive to container {}",
                id
            )));
        }
        let spec = state
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound {
                kind: "container",
                name: id.to_string(),
            })?;

        let mut tar = tar::Archive::new(archive.as_slice());
        for entry in tar.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let rel = entry.path()?.to_string_lossy().to_string();
            let path = format!("{}/{}", dest.trim_end_matches('/'), rel);
            let uid = entry.header().uid()?;
            let gid = entry.header().gid()?;
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;

            let mut fs = ContainerFs {
                mounts: mounts(&spec),
                volumes: &mut state.volumes,
            };
            if let Some((volume, rel)) = fs.resolve(&path)
                && let Some(files) = fs.volumes.get_mut(&volume)
            {
                files.insert(rel, VolumeFile { content, uid, gid });
            }
        }
        Ok(())
    }

    async fn run_container(&self, id: &str, output: &mut (dyn Write + Send)) -> Result<i64> {
        let spec = self
            .state()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound {
                kind: "container",
                name: id.to_string(),
            })?;

        if let Some(command) = &self.hang_on
            && spec.cmd.first().unwrap_or(&spec.image) == command
        {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        let mut fs = ContainerFs {
            mounts: mounts(&spec),
            volumes: &mut state.volumes,
        };
        Ok((self.handler)(&spec, &mut fs, output))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        match state.containers.remove(id) {
            Some(_) => {
                state.removed_containers.push(id.to_string());
                Ok(())
            }
            None => Err(ContainerError::NotFound {
                kind: "container",
                name: id.to_string(),
            }),
        }
    }

    async fn remove_image(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        match state.images.iter().position(|image| image == name) {
            Some(index) => {
                state.images.remove(index);
                state.removed_images.push(name.to_string());
                Ok(())
            }
            None => Err(ContainerError::ImageNotFound {
                image: name.to_string(),
            }),
        }
    }

    async fn image_exposed_ports(&self, image: &str) -> Result<Vec<String>> {
        self.state()
            .exposed_ports
            .get(image)
            .cloned()
            .ok_or_else(|| ContainerError::ImageNotFound {
                image: image.to_string(),
            })
    }
}

/// `volume:/target` 形式のバインドのうち、存在するボリュームのもの
fn mounts(spec: &ContainerSpec) -> Vec<(String, String)> {
    spec.binds
        .iter()
        .filter_map(|bind| {
            let (volume, target) = bind.split_once(':')?;
            (!volume.starts_with('/')).then(|| (target.to_string(), volume.to_string()))
        })
        .collect()
}

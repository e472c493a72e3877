//! ビルダーイメージに追加するレイヤー tar の生成
//!
//! tar 内のパスはルートからの相対パス（`buildpacks/...`）で書き込み、
//! イメージへの追加時に `/` 直下へ展開されます。シンボリックリンクの
//! リンク先のみ絶対パスを使います。

use crate::buildpack::Buildpack;
use crate::error::{BuildError, BuildResult};
use crate::metadata::{GroupMetadata, encode_order};
use crate::stack::StackMetadata;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{EntryType, Header};
use walkdir::WalkDir;

pub const BUILDPACKS_DIR: &str = "buildpacks";
pub const PLATFORM_DIR: &str = "platform";

const MAX_ARCHIVE_SIZE: usize = 500 * 1024 * 1024; // 500MB

/// 作業ディレクトリにレイヤー tar を書き出す
pub struct LayerFactory<'a> {
    dest: &'a Path,
    uid: u32,
    gid: u32,
}

impl<'a> LayerFactory<'a> {
    /// `uid` / `gid` は buildpack レイヤーの所有者
    pub fn new(dest: &'a Path, uid: u32, gid: u32) -> Self {
        Self { dest, uid, gid }
    }

    /// `/platform/env/<KEY>` に値をそのまま書き込んだレイヤー
    pub fn env_layer(&self, env: &BTreeMap<String, String>) -> BuildResult<PathBuf> {
        let path = self.dest.join("env.tar");
        let fail = |e: std::io::Error| BuildError::LayerFailed {
            artifact: "env".to_string(),
            message: e.to_string(),
        };

        let mut tar = tar::Builder::new(File::create(&path).map_err(fail)?);
        let env_dir = format!("{}/env", PLATFORM_DIR);
        append_dir(&mut tar, PLATFORM_DIR, 0o555, 0, 0).map_err(fail)?;
        append_dir(&mut tar, &env_dir, 0o555, 0, 0).map_err(fail)?;
        for (key, value) in env {
            append_file(
                &mut tar,
                &format!("{}/{}", env_dir, key),
                value.as_bytes(),
                0o444,
                0,
                0,
            )
            .map_err(fail)?;
        }
        tar.into_inner().and_then(|mut f| f.flush()).map_err(fail)?;

        Ok(path)
    }

    /// buildpack のファイルを `/buildpacks/<escaped-id>/<version>` に配置するレイヤー
    ///
    /// 全エントリの所有者はビルダーの uid/gid。`latest` の場合は
    /// `/buildpacks/<escaped-id>/latest` シンボリックリンクも追加する
    pub fn buildpack_layer(&self, bp: &Buildpack) -> BuildResult<PathBuf> {
        let escaped = bp.escaped_id();
        let path = self.dest.join(format!("{}.{}.tar", escaped, bp.version));
        let fail = |message: String| BuildError::LayerFailed {
            artifact: format!("buildpack '{}@{}'", bp.id, bp.version),
            message,
        };

        let file = File::create(&path).map_err(|e| fail(e.to_string()))?;
        let mut tar = tar::Builder::new(file);
        let base = format!("{}/{}/{}", BUILDPACKS_DIR, escaped, bp.version);
        append_dir_all(&mut tar, &bp.dir, &base, self.uid, self.gid).map_err(fail)?;

        if bp.latest {
            let mut header = new_header(EntryType::Symlink, 0o666, self.uid, self.gid);
            tar.append_link(
                &mut header,
                format!("{}/{}/latest", BUILDPACKS_DIR, escaped),
                format!("/{}", base),
            )
            .map_err(|e| fail(format!("latest symlink: {}", e)))?;
        }

        tar.into_inner()
            .and_then(|mut f| f.flush())
            .map_err(|e| fail(e.to_string()))?;

        Ok(path)
    }

    /// `/buildpacks/order.toml`
    pub fn order_layer(&self, groups: &[GroupMetadata]) -> BuildResult<PathBuf> {
        let content = encode_order(groups)?;
        self.single_file_layer("order", &format!("{}/order.toml", BUILDPACKS_DIR), &content)
    }

    /// `/buildpacks/stack.toml`
    pub fn stack_layer(&self, stack: &StackMetadata) -> BuildResult<PathBuf> {
        let content = stack.encode_toml()?;
        self.single_file_layer("stack", &format!("{}/stack.toml", BUILDPACKS_DIR), &content)
    }

    fn single_file_layer(&self, artifact: &str, name: &str, content: &str) -> BuildResult<PathBuf> {
        let path = self.dest.join(format!("{}.tar", artifact));
        let fail = |e: std::io::Error| BuildError::LayerFailed {
            artifact: artifact.to_string(),
            message: e.to_string(),
        };

        let mut tar = tar::Builder::new(File::create(&path).map_err(fail)?);
        append_file(&mut tar, name, content.as_bytes(), 0o644, 0, 0).map_err(fail)?;
        tar.into_inner().and_then(|mut f| f.flush()).map_err(fail)?;

        Ok(path)
    }
}

/// ディレクトリを `base` 配下に展開される tar としてメモリ上に作成
///
/// コンテナへのアプリケーションコピーに使う
pub fn dir_archive(src: &Path, base: &str, uid: u32, gid: u32) -> BuildResult<Vec<u8>> {
    tracing::debug!("Creating archive from: {}", src.display());

    let mut tar = tar::Builder::new(Vec::new());
    append_dir_all(&mut tar, src, base, uid, gid).map_err(|message| BuildError::LayerFailed {
        artifact: format!("archive of '{}'", src.display()),
        message,
    })?;
    let data = tar.into_inner()?;

    tracing::debug!("Archive created: {} bytes", data.len());
    if data.len() > MAX_ARCHIVE_SIZE {
        tracing::warn!(
            "警告: アプリケーションディレクトリが大きすぎます（{}MB）",
            data.len() / 1024 / 1024
        );
    }

    Ok(data)
}

fn append_dir_all<W: Write>(
    tar: &mut tar::Builder<W>,
    src: &Path,
    base: &str,
    uid: u32,
    gid: u32,
) -> Result<(), String> {
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| e.to_string())?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| e.to_string())?;
        let name = if rel.as_os_str().is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, rel.to_string_lossy())
        };

        let metadata = entry
            .path()
            .symlink_metadata()
            .map_err(|e| format!("{}: {}", entry.path().display(), e))?;
        let mode = file_mode(&metadata);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            append_dir(tar, &name, mode, uid, gid).map_err(|e| e.to_string())?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| e.to_string())?;
            let mut header = new_header(EntryType::Symlink, mode, uid, gid);
            tar.append_link(&mut header, &name, &target)
                .map_err(|e| format!("{}: {}", name, e))?;
        } else {
            let file = File::open(entry.path())
                .map_err(|e| format!("{}: {}", entry.path().display(), e))?;
            let mut header = new_header(EntryType::Regular, mode, uid, gid);
            header.set_size(metadata.len());
            tar.append_data(&mut header, &name, file)
                .map_err(|e| format!("{}: {}", name, e))?;
        }
    }
    Ok(())
}

fn append_dir<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
) -> std::io::Result<()> {
    let mut header = new_header(EntryType::Directory, mode, uid, gid);
    tar.append_data(&mut header, name, std::io::empty())
}

fn append_file<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    content: &[u8],
    mode: u32,
    uid: u32,
    gid: u32,
) -> std::io::Result<()> {
    let mut header = new_header(EntryType::Regular, mode, uid, gid);
    header.set_size(content.len() as u64);
    tar.append_data(&mut header, name, content)
}

fn new_header(entry_type: EntryType, mode: u32, uid: u32, gid: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(0);
    header.set_mode(mode);
    header.set_uid(uid as u64);
    header.set_gid(gid as u64);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );
    header
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() { 0o755 } else { 0o644 }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use tempfile::tempdir;

    /// tar の内容（パス, エントリ）
    pub(crate) struct TarEntry {
        pub path: String,
        pub entry_type: EntryType,
        pub mode: u32,
        pub uid: u64,
        pub gid: u64,
        pub link_name: Option<String>,
        pub content: Vec<u8>,
    }

    pub(crate) fn read_tar(data: &[u8]) -> Vec<TarEntry> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let header = entry.header().clone();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                let link_name = entry
                    .link_name()
                    .unwrap()
                    .map(|l| l.to_string_lossy().to_string());
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                TarEntry {
                    path,
                    entry_type: header.entry_type(),
                    mode: header.mode().unwrap(),
                    uid: header.uid().unwrap(),
                    gid: header.gid().unwrap(),
                    link_name,
                    content,
                }
            })
            .collect()
    }

    fn buildpack_dir() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("buildpack.toml"),
            "[buildpack]\nid = \"some/buildpack\"\nversion = \"1.2.3\"\n\n[[stacks]]\nid = \"some.stack.id\"\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin").join("detect"), "#!/bin/sh\nexit 0\n").unwrap();
        fs::write(dir.path().join("bin").join("build"), "#!/bin/sh\nexit 0\n").unwrap();
        dir
    }

    #[test]
    fn test_env_layer() {
        let dest = tempdir().unwrap();
        let factory = LayerFactory::new(dest.path(), 1234, 4321);
        let env = BTreeMap::from([
            ("SOME_KEY".to_string(), "some-val".to_string()),
            ("OTHER_KEY".to_string(), "other-val".to_string()),
        ]);

        let path = factory.env_layer(&env).unwrap();
        let entries = read_tar(&fs::read(path).unwrap());

        let platform = entries.iter().find(|e| e.path == "platform").unwrap();
        assert_eq!(platform.entry_type, EntryType::Directory);
        assert_eq!(platform.mode, 0o555);
        let env_dir = entries.iter().find(|e| e.path == "platform/env").unwrap();
        assert_eq!(env_dir.mode, 0o555);

        let some_key = entries
            .iter()
            .find(|e| e.path == "platform/env/SOME_KEY")
            .unwrap();
        assert_eq!(some_key.content, b"some-val");
        assert_eq!(some_key.mode, 0o444);
        let other_key = entries
            .iter()
            .find(|e| e.path == "platform/env/OTHER_KEY")
            .unwrap();
        assert_eq!(other_key.content, b"other-val");
    }

    #[test]
    fn test_buildpack_layer_with_latest() {
        let bp_dir = buildpack_dir();
        let bp = Buildpack::from_dir(bp_dir.path(), true).unwrap();
        let dest = tempdir().unwrap();
        let factory = LayerFactory::new(dest.path(), 1234, 4321);

        let path = factory.buildpack_layer(&bp).unwrap();
        assert!(path.ends_with("some_buildpack.1.2.3.tar"));
        let entries = read_tar(&fs::read(path).unwrap());

        let detect = entries
            .iter()
            .find(|e| e.path == "buildpacks/some_buildpack/1.2.3/bin/detect")
            .unwrap();
        assert_eq!(detect.content, b"#!/bin/sh\nexit 0\n");
        for entry in &entries {
            assert_eq!(entry.uid, 1234, "{}", entry.path);
            assert_eq!(entry.gid, 4321, "{}", entry.path);
        }

        let latest = entries
            .iter()
            .find(|e| e.path == "buildpacks/some_buildpack/latest")
            .unwrap();
        assert_eq!(latest.entry_type, EntryType::Symlink);
        assert_eq!(
            latest.link_name.as_deref(),
            Some("/buildpacks/some_buildpack/1.2.3")
        );
    }

    #[test]
    fn test_buildpack_layer_without_latest() {
        let bp_dir = buildpack_dir();
        let bp = Buildpack::from_dir(bp_dir.path(), false).unwrap();
        let dest = tempdir().unwrap();

        let path = LayerFactory::new(dest.path(), 1, 1).buildpack_layer(&bp).unwrap();
        let entries = read_tar(&fs::read(path).unwrap());
        assert!(entries.iter().all(|e| !e.path.ends_with("latest")));
        assert!(
            entries
                .iter()
                .any(|e| e.path == "buildpacks/some_buildpack/1.2.3/buildpack.toml")
        );
    }

    #[test]
    fn test_order_and_stack_layers() {
        let dest = tempdir().unwrap();
        let factory = LayerFactory::new(dest.path(), 1, 1);

        let order = factory.order_layer(&[]).unwrap();
        let entries = read_tar(&fs::read(order).unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "buildpacks/order.toml");

        let stack = factory.stack_layer(&StackMetadata::default()).unwrap();
        let entries = read_tar(&fs::read(stack).unwrap());
        assert_eq!(entries[0].path, "buildpacks/stack.toml");
        assert!(String::from_utf8_lossy(&entries[0].content).contains("run-image"));
    }

    #[test]
    fn test_dir_archive_owner() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("app.js"), "console.log('hi')").unwrap();
        fs::create_dir(src.path().join("lib")).unwrap();
        fs::write(src.path().join("lib").join("util.js"), "").unwrap();

        let data = dir_archive(src.path(), "workspace", 1000, 1001).unwrap();
        let entries = read_tar(&data);

        assert_eq!(entries[0].path, "workspace");
        assert!(entries.iter().any(|e| e.path == "workspace/app.js"));
        assert!(entries.iter().any(|e| e.path == "workspace/lib/util.js"));
        assert!(entries.iter().all(|e| e.uid == 1000 && e.gid == 1001));
    }
}

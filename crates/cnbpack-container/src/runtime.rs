use crate::error::{ContainerError, Result};
use std::io::Write;

/// コンテナランタイムのトレイト
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime {
    async fn create_volume(&self, name: &str) -> Result<()>;

    /// ボリュームを削除（存在しない場合は NotFound）
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// コンテナを作成し、IDを返す（起動はしない）
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// tar アーカイブを `dest` に展開
    async fn copy_to_container(&self, id: &str, dest: &str, archive: Vec<u8>) -> Result<()>;

    /// コンテナを起動し、終了まで stdout/stderr を `output` に書き込む
    ///
    /// 終了コードを返す
    async fn run_container(&self, id: &str, output: &mut (dyn Write + Send)) -> Result<i64>;

    /// コンテナを強制削除（存在しない場合は NotFound）
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// イメージを強制削除（存在しない場合は NotFound）
    async fn remove_image(&self, name: &str) -> Result<()>;

    /// イメージが公開しているポート（例: `8080/tcp`）
    async fn image_exposed_ports(&self, image: &str) -> Result<Vec<String>>;
}

/// コンテナの作成設定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=VALUE`
    pub env: Vec<String>,
    pub user: Option<String>,
    /// `source:target` 形式のバインド
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
    pub ports: Vec<PortMapping>,
}

impl ContainerSpec {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// `target` にマウントされているバインドのソース
    pub fn bind_source(&self, target: &str) -> Option<&str> {
        self.binds.iter().find_map(|bind| {
            let mut parts = bind.split(':');
            let source = parts.next()?;
            (parts.next()? == target).then_some(source)
        })
    }
}

/// ホストとコンテナのポート対応
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    /// ポート指定を解析
    ///
    /// # Examples
    /// - `8080` -> 0.0.0.0:8080 -> 8080/tcp
    /// - `3000:8080` -> 0.0.0.0:3000 -> 8080/tcp
    /// - `127.0.0.1:3000:8080/udp`
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || ContainerError::InvalidPort(spec.to_string());

        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, proto)) if proto == "tcp" || proto == "udp" => (ports, proto),
            Some(_) => return Err(invalid()),
            None => (spec, "tcp"),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [port] => ("0.0.0.0", *port, *port),
            [host, container] => ("0.0.0.0", *host, *container),
            [ip, host, container] => (*ip, *host, *container),
            _ => return Err(invalid()),
        };

        Ok(Self {
            host_ip: host_ip.to_string(),
            host_port: host_port.parse().map_err(|_| invalid())?,
            container_port: container_port.parse().map_err(|_| invalid())?,
            protocol: protocol.to_string(),
        })
    }

    /// `8080/tcp` 形式のコンテナポート
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_mapping() {
        let p = PortMapping::parse("8080").unwrap();
        assert_eq!((p.host_port, p.container_port), (8080, 8080));
        assert_eq!(p.host_ip, "0.0.0.0");
        assert_eq!(p.container_key(), "8080/tcp");

        let p = PortMapping::parse("3000:8080").unwrap();
        assert_eq!((p.host_port, p.container_port), (3000, 8080));

        let p = PortMapping::parse("127.0.0.1:3000:8080/udp").unwrap();
        assert_eq!(p.host_ip, "127.0.0.1");
        assert_eq!(p.container_key(), "8080/udp");
    }

    #[test]
    fn test_parse_port_mapping_invalid() {
        assert!(PortMapping::parse("abc").is_err());
        assert!(PortMapping::parse("8080/sctp").is_err());
        assert!(PortMapping::parse("1:2:3:4").is_err());
        assert!(PortMapping::parse("70000").is_err());
    }

    #[test]
    fn test_bind_source() {
        let mut spec = ContainerSpec::new("some/builder");
        spec.binds = vec![
            "pack-layers-abc:/layers".to_string(),
            "pack-app-abc:/workspace".to_string(),
        ];
        assert_eq!(spec.bind_source("/workspace"), Some("pack-app-abc"));
        assert_eq!(spec.bind_source("/layers"), Some("pack-layers-abc"));
        assert_eq!(spec.bind_source("/other"), None);
    }
}

//! イメージ参照の解析
//!
//! `registry/repository:tag` / `registry/repository@digest` 形式の参照を
//! 正規化された [`ImageRef`] に変換します。レジストリ省略時は Docker Hub
//! （`index.docker.io`）として扱います。

use crate::error::{BuildError, BuildResult};
use std::fmt;
use std::str::FromStr;

/// レジストリ省略時のデフォルト
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// タグ省略時のデフォルト
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Identifier {
    Tag(String),
    Digest(String),
}

/// 正規化済みのイメージ参照
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    registry: String,
    repository: String,
    identifier: Identifier,
}

impl ImageRef {
    /// イメージ参照を解析
    ///
    /// # Examples
    /// - `nginx` -> `index.docker.io/library/nginx:latest`
    /// - `ghcr.io/org/app:v1.0` -> `ghcr.io/org/app:v1.0`
    /// - `localhost:5000/app` -> `localhost:5000/app:latest`
    pub fn parse(reference: &str) -> BuildResult<Self> {
        let invalid = |reason: &str| BuildError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        let (name_part, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|r| invalid(&r))?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name_part, tag) = split_tag(name_part);
        if let Some(tag) = tag {
            validate_tag(tag).map_err(|r| invalid(&r))?;
        }

        let (registry, repository) = split_registry(name_part);
        if registry.is_empty() {
            return Err(invalid("registry is empty"));
        }
        validate_repository(&repository).map_err(|r| invalid(&r))?;

        let identifier = match (digest, tag) {
            (Some(digest), _) => Identifier::Digest(digest),
            (None, Some(tag)) => Identifier::Tag(tag.to_string()),
            (None, None) => Identifier::Tag(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            identifier,
        })
    }

    /// タグ参照として解析（ダイジェスト参照はエラー）
    pub fn parse_tag(reference: &str) -> BuildResult<Self> {
        let parsed = Self::parse(reference)?;
        if parsed.tag().is_none() {
            return Err(BuildError::InvalidReference {
                reference: reference.to_string(),
                reason: "not a tag reference".to_string(),
            });
        }
        Ok(parsed)
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// タグまたはダイジェスト
    pub fn identifier(&self) -> &str {
        match &self.identifier {
            Identifier::Tag(tag) => tag,
            Identifier::Digest(digest) => digest,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.identifier {
            Identifier::Tag(tag) => Some(tag),
            Identifier::Digest(_) => None,
        }
    }

    /// `registry/repository`
    pub fn context(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// 完全修飾名
    pub fn name(&self) -> String {
        match &self.identifier {
            Identifier::Tag(tag) => format!("{}/{}:{}", self.registry, self.repository, tag),
            Identifier::Digest(digest) => {
                format!("{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for ImageRef {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 参照のレジストリホストを取得（解析できない場合は None）
pub fn registry_of(reference: &str) -> Option<String> {
    ImageRef::parse(reference)
        .ok()
        .map(|r| r.registry().to_string())
}

/// 最後の `/` 以降にある `:` をタグ区切りとみなす
///
/// `localhost:5000/app` の `:5000` はポート番号なのでタグではない
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let last_segment_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[last_segment_start..].rfind(':') {
        Some(pos) => {
            let pos = last_segment_start + pos;
            (&name[..pos], Some(&name[pos + 1..]))
        }
        None => (name, None),
    }
}

fn split_registry(name: &str) -> (String, String) {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    let registry = if registry == "docker.io" {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry
    };

    // Docker Hub の公式イメージは library/ 配下
    let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        format!("library/{}", repository)
    } else {
        repository
    };

    (registry, repository)
}

fn validate_repository(repository: &str) -> Result<(), String> {
    if repository.is_empty() {
        return Err("repository is empty".to_string());
    }

    for component in repository.split('/') {
        if component.is_empty() {
            return Err(format!("empty path component in '{}'", repository));
        }
        let starts_ok = component
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let ends_ok = component
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !starts_ok || !ends_ok {
            return Err(format!("invalid path component '{}'", component));
        }
        for c in component.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '.' && c != '-' && c != '_'
            {
                return Err(format!("invalid character '{}' in repository", c));
            }
        }
    }

    Ok(())
}

/// Docker タグの制約:
/// - 128文字以下
/// - 英数字、ピリオド、ハイフン、アンダースコアのみ
/// - 先頭はピリオドまたはハイフンではない
fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("tag is empty".to_string());
    }
    if tag.len() > 128 {
        return Err(format!("tag too long ({} characters, max 128)", tag.len()));
    }
    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(format!("invalid tag '{}'", tag));
    }
    for c in tag.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            return Err(format!("invalid character '{}' in tag", c));
        }
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<(), String> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(format!("invalid digest '{}'", digest));
    };
    if algorithm.is_empty()
        || !algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(format!("invalid digest algorithm '{}'", algorithm));
    }
    if hex.len() < 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid digest '{}'", digest));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_hub_short_name() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.registry(), "index.docker.io");
        assert_eq!(r.repository(), "library/nginx");
        assert_eq!(r.identifier(), "latest");
        assert_eq!(r.name(), "index.docker.io/library/nginx:latest");
    }

    #[test]
    fn test_parse_docker_hub_user_image() {
        let r = ImageRef::parse("default/run").unwrap();
        assert_eq!(r.name(), "index.docker.io/default/run:latest");

        let r = ImageRef::parse("docker.io/myuser/app:v1").unwrap();
        assert_eq!(r.name(), "index.docker.io/myuser/app:v1");
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageRef::parse("example.com/some/repo:tag").unwrap();
        assert_eq!(r.registry(), "example.com");
        assert_eq!(r.repository(), "some/repo");
        assert_eq!(r.identifier(), "tag");
        assert_eq!(r.context(), "example.com/some/repo");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageRef::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "app");
        assert_eq!(r.identifier(), "latest");

        let r = ImageRef::parse("localhost:5000/app:dev").unwrap();
        assert_eq!(r.identifier(), "dev");
    }

    #[test]
    fn test_parse_digest() {
        let digest = "sha256:954e1f01e80ce09d0887ff6ea10b13a812cb01932a0781d6b0cc23f743a874fd";
        let r = ImageRef::parse(&format!("registry.com/my/image@{}", digest)).unwrap();
        assert_eq!(r.identifier(), digest);
        assert!(r.tag().is_none());
        assert!(ImageRef::parse_tag(&format!("registry.com/my/image@{}", digest)).is_err());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("not@valid").is_err());
        assert!(ImageRef::parse("Upper/Case").is_err());
        assert!(ImageRef::parse("some/app:-bad").is_err());
        assert!(ImageRef::parse("some//app").is_err());
    }

    #[test]
    fn test_registry_of() {
        assert_eq!(
            registry_of("registry1.example.com/run/mirror").as_deref(),
            Some("registry1.example.com")
        );
        assert_eq!(registry_of("local/mirror").as_deref(), Some("index.docker.io"));
        assert_eq!(registry_of("not@valid"), None);
    }
}

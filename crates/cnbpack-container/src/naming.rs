//! 一時リソースの命名

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

const SUFFIX_LEN: usize = 10;

/// ランダムなサフィックス付きの名前を生成
///
/// 同時に実行される複数のビルドが衝突しないように、一時ビルダーイメージと
/// ボリューム名に小文字10文字のサフィックスを付ける
pub struct NameGenerator {
    rng: Mutex<StdRng>,
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl NameGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// 再現可能な名前を生成（テスト用）
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn suffix(&self) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        (0..SUFFIX_LEN)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect()
    }

    /// `pack.local/builder/<suffix>`
    pub fn builder_image(&self) -> String {
        format!("pack.local/builder/{}", self.suffix())
    }

    /// `pack-layers-<suffix>`
    pub fn layers_volume(&self) -> String {
        format!("pack-layers-{}", self.suffix())
    }

    /// `pack-app-<suffix>`
    pub fn app_volume(&self) -> String {
        format!("pack-app-{}", self.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_is_ten_lowercase_letters() {
        let names = NameGenerator::new();
        for _ in 0..20 {
            let suffix = names.suffix();
            assert_eq!(suffix.len(), 10);
            assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn test_name_formats() {
        let names = NameGenerator::seeded(7);
        assert!(names.builder_image().starts_with("pack.local/builder/"));
        assert!(names.layers_volume().starts_with("pack-layers-"));
        assert!(names.app_volume().starts_with("pack-app-"));
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let a = NameGenerator::seeded(42);
        let b = NameGenerator::seeded(42);
        assert_eq!(a.builder_image(), b.builder_image());
        assert_eq!(a.layers_volume(), b.layers_volume());
        assert_ne!(a.app_volume(), a.app_volume());
    }
}

use indicatif::{ProgressBar, ProgressStyle};

/// イメージ取得中のスピナー
pub struct PullProgress {
    progress_bar: ProgressBar,
}

impl PullProgress {
    pub fn new(image: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Pulling {}...", image));

        Self { progress_bar: pb }
    }

    /// 非表示のスピナー（--quiet やテスト用）
    pub fn hidden() -> Self {
        Self {
            progress_bar: ProgressBar::hidden(),
        }
    }

    pub fn set_message(&self, msg: &str) {
        self.progress_bar.set_message(msg.to_string());
        self.progress_bar.tick();
    }

    pub fn finish_success(&self, image: &str) {
        self.progress_bar
            .finish_with_message(format!("Pulled {} ✓", image));
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .finish_with_message(format!("Pull failed: {}", error));
    }
}

//! コンテナ出力の整形

use colored::{Color, Colorize};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// 各行の先頭に `[name] ` を付けて書き込む
pub struct PrefixWriter<'a> {
    prefix: String,
    inner: &'a mut (dyn Write + Send),
    /// 行の途中まで書き込まれたデータ
    pending: Vec<u8>,
}

impl<'a> PrefixWriter<'a> {
    pub fn new(name: &str, inner: &'a mut (dyn Write + Send)) -> Self {
        Self {
            prefix: format!("[{}] ", name),
            inner,
            pending: Vec::new(),
        }
    }

    /// プレフィックスに色を付ける
    pub fn colored(name: &str, color: Color, inner: &'a mut (dyn Write + Send)) -> Self {
        Self {
            prefix: format!("{} ", format!("[{}]", name).color(color)),
            inner,
            pending: Vec::new(),
        }
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.inner.write_all(self.prefix.as_bytes())?;
        self.inner.write_all(line)?;
        self.inner.write_all(b"\n")
    }
}

impl Write for PrefixWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = line.strip_suffix(b"\n").unwrap_or(&line);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            self.write_line(line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Drop for PrefixWriter<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            let _ = self.write_line(&line);
        }
        let _ = self.inner.flush();
    }
}

/// 複数の書き込み先で共有できるバッファ（テストおよび出力の収集用）
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&data).to_string()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//! HTML → Markdown through an external pandoc filter.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{HunterError, Result};

#[derive(Debug, Clone)]
pub struct Converter {
    cmd: String,
    suppress_raw_html: bool,
}

impl Converter {
    pub fn new(cmd: impl Into<String>, suppress_raw_html: bool) -> Self {
        Converter {
            cmd: cmd.into(),
            suppress_raw_html,
        }
    }

    fn target(&self) -> &'static str {
        if self.suppress_raw_html {
            "gfm-raw_html"
        } else {
            "gfm"
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-f".into(),
            "html".into(),
            "-t".into(),
            self.target().into(),
            "--wrap=none".into(),
        ]
    }

    fn spawn_error(&self, e: std::io::Error) -> HunterError {
        if e.kind() == ErrorKind::NotFound {
            HunterError::ConverterMissing { cmd: self.cmd.clone() }
        } else {
            HunterError::Io(e)
        }
    }

    /// Convert one file into another. Fails fast when the command is missing.
    pub async fn convert_file(&self, input: &Path, output: &Path) -> Result<()> {
        if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        debug!("{} {} -> {}", self.cmd, input.display(), output.display());
        let out = Command::new(&self.cmd)
            .args(self.args())
            .arg("-o")
            .arg(output)
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        if !out.status.success() {
            return Err(HunterError::ConverterFailed {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Convert an HTML string, piping it through the filter.
    pub async fn convert_html(&self, html: &str) -> Result<String> {
        let mut child = Command::new(&self.cmd)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(html.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let out = child.wait_with_output().await?;
        if !out.status.success() {
            return Err(HunterError::ConverterFailed {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_html_switch_changes_target() {
        assert!(Converter::new("pandoc", true).args().contains(&"gfm-raw_html".to_string()));
        assert!(Converter::new("pandoc", false).args().contains(&"gfm".to_string()));
    }

    #[tokio::test]
    async fn missing_command_is_reported() {
        let conv = Converter::new("faculty-hunter-no-such-converter", true);
        let err = conv.convert_html("<p>x</p>").await.unwrap_err();
        assert!(matches!(err, HunterError::ConverterMissing { .. }));

        let dir = tempfile::tempdir().unwrap();
        let err = conv
            .convert_file(&dir.path().join("in.html"), &dir.path().join("out.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, HunterError::ConverterMissing { .. }));
    }
}

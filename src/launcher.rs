use crate::config::Config;
use crate::error::LaunchError;
use crate::storage;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;

/// Starts the external subtitle tool for one source file without waiting on it.
pub trait Launcher {
    fn launch(&self, source: &Path) -> Result<(), LaunchError>;
}

#[derive(Debug, Clone)]
pub struct CommandLauncher {
    tool: PathBuf,
    output_dir: PathBuf,
    format: String,
    device: String,
    extra_args: Vec<String>,
}

impl CommandLauncher {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tool: storage::absolute(&config.tool_path),
            output_dir: storage::absolute(&config.output_dir),
            format: config.tool_format.clone(),
            device: config.tool_device.clone(),
            extra_args: config.tool_extra_args.clone(),
        }
    }

    pub fn args_for(&self, source: &Path) -> Vec<String> {
        let mut args = vec![
            format!("--sub_formats={}", self.format),
            format!("--output_dir={}", self.output_dir.display()),
            format!("--device={}", self.device),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push(storage::absolute(source).display().to_string());
        args
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, source: &Path) -> Result<(), LaunchError> {
        if !self.tool.exists() {
            return Err(LaunchError::ToolMissing(self.tool.clone()));
        }
        if !source.exists() {
            return Err(LaunchError::SourceMissing(source.to_path_buf()));
        }
        let mut command = Command::new(&self.tool);
        command
            .args(self.args_for(source))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = self.tool.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|err| LaunchError::Spawn {
            tool: self.tool.clone(),
            source: err,
        })?;

        if let Ok(Some(status)) = child.try_wait() {
            if !status.success() {
                return Err(LaunchError::ExitedEarly(status));
            }
        }
        tracing::info!(
            tool = %self.tool.display(),
            source = %source.display(),
            pid = child.id(),
            "subtitle tool launched"
        );
        reap_in_background(child, source.to_path_buf());
        Ok(())
    }
}

/// Waits on the child off the loop thread so it does not linger as a zombie.
/// Nothing reads the result; completion is judged from the output file.
fn reap_in_background(mut child: Child, source: PathBuf) {
    thread::spawn(move || match child.wait() {
        Ok(status) => {
            tracing::debug!(source = %source.display(), %status, "subtitle tool exited");
        }
        Err(err) => {
            tracing::debug!(source = %source.display(), error = %err, "wait on subtitle tool failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::tempdir;

    fn launcher(tool: PathBuf, output_dir: PathBuf) -> CommandLauncher {
        let mut config = Config::default();
        config.tool_path = tool;
        config.output_dir = output_dir;
        config.tool_extra_args = vec!["--language=ja".to_string()];
        CommandLauncher::from_config(&config)
    }

    #[test]
    fn args_carry_format_output_device_and_input() {
        let launcher = launcher(PathBuf::from("/opt/tool/infer"), PathBuf::from("/subs"));
        let args = launcher.args_for(Path::new("/in/movie.mp4"));
        assert_eq!(
            args,
            vec![
                "--sub_formats=srt".to_string(),
                "--output_dir=/subs".to_string(),
                "--device=cuda".to_string(),
                "--language=ja".to_string(),
                "/in/movie.mp4".to_string(),
            ]
        );
    }

    #[test]
    fn relative_paths_are_resolved_before_the_tool_changes_directory() -> Result<()> {
        let cwd = std::env::current_dir()?;
        let launcher = launcher(PathBuf::from("/opt/tool/infer"), PathBuf::from("subtitles"));
        let args = launcher.args_for(Path::new("downloads/movie.mp4"));
        assert_eq!(
            args[1],
            format!("--output_dir={}", cwd.join("subtitles").display())
        );
        assert_eq!(
            args.last().map(String::as_str),
            Some(cwd.join("downloads").join("movie.mp4").display().to_string().as_str())
        );
        Ok(())
    }

    #[test]
    fn missing_tool_is_a_launch_failure() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("movie.mp4");
        fs::write(&source, b"video")?;
        let launcher = launcher(dir.path().join("no-such-tool"), dir.path().to_path_buf());
        let err = launcher.launch(&source).expect_err("tool missing");
        assert!(matches!(err, LaunchError::ToolMissing(_)));
        Ok(())
    }
}

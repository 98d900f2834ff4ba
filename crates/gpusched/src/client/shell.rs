use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use crate::common::env::CUDA_DEVICE_ORDER;
use crate::common::error::SchedError;
use crate::common::utils::str::single_quote;
use crate::scheduler::allocator::format_gpus;
use crate::GpuIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
}

impl ShellKind {
    /// Detects the shell from its path, e.g. the value of `$SHELL`.
    pub fn detect(shell: &Path) -> crate::Result<Self> {
        match shell.file_name().and_then(|name| name.to_str()) {
            Some("bash") => Ok(ShellKind::Bash),
            Some("zsh") => Ok(ShellKind::Zsh),
            _ => Err(SchedError::UnsupportedShell(shell.display().to_string())),
        }
    }
}

/// Interactive shell with the assigned GPUs exported.
///
/// The shell reads a generated startup file that sources the user's own one and then
/// exports the GPU visibility variable, so the user configuration cannot override it.
/// The generated file lives in a temporary directory that is removed on drop.
pub struct ShellSession {
    shell: PathBuf,
    kind: ShellKind,
    rc_dir: TempDir,
}

impl ShellSession {
    pub fn prepare(
        shell: &Path,
        home: &Path,
        visibility_var: &str,
        gpus: &[GpuIndex],
    ) -> crate::Result<Self> {
        let kind = ShellKind::detect(shell)?;
        let rc_dir = TempDir::with_prefix("gpusched-shell")?;
        let (rc_name, user_rc) = match kind {
            ShellKind::Bash => (".bashrc", home.join(".bashrc")),
            ShellKind::Zsh => {
                let zdotdir = std::env::var_os("ZDOTDIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| home.to_path_buf());
                (".zshrc", zdotdir.join(".zshrc"))
            }
        };
        std::fs::write(
            rc_dir.path().join(rc_name),
            render_rc(kind, &user_rc, visibility_var, gpus),
        )?;
        Ok(Self {
            shell: shell.to_path_buf(),
            kind,
            rc_dir,
        })
    }

    pub fn kind(&self) -> ShellKind {
        self.kind
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.shell);
        match self.kind {
            ShellKind::Bash => {
                command
                    .arg("--rcfile")
                    .arg(self.rc_dir.path().join(".bashrc"))
                    .arg("-i");
            }
            ShellKind::Zsh => {
                command.env("ZDOTDIR", self.rc_dir.path()).arg("-i");
            }
        }
        command
    }
}

fn render_rc(kind: ShellKind, user_rc: &Path, visibility_var: &str, gpus: &[GpuIndex]) -> String {
    let mut rc = String::new();
    if kind == ShellKind::Zsh {
        // Later startup files of zsh are looked up in the original location
        if let Some(dir) = user_rc.parent() {
            rc.push_str(&format!("export ZDOTDIR={}\n", quote(dir)));
        }
    }
    let user_rc = quote(user_rc);
    rc.push_str(&format!(
        "if [ -f {user_rc} ]; then . {user_rc}; fi\n\
         export {visibility_var}={}\n\
         export {CUDA_DEVICE_ORDER}=PCI_BUS_ID\n",
        format_gpus(gpus)
    ));
    rc
}

fn quote(path: &Path) -> String {
    single_quote(&path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::client::shell::{ShellKind, ShellSession, render_rc};
    use crate::common::error::SchedError;

    #[test]
    fn detect_shells() {
        assert_eq!(
            ShellKind::detect(Path::new("/bin/bash")).unwrap(),
            ShellKind::Bash
        );
        assert_eq!(
            ShellKind::detect(Path::new("/usr/local/bin/zsh")).unwrap(),
            ShellKind::Zsh
        );
        assert!(matches!(
            ShellKind::detect(Path::new("/usr/bin/fish")),
            Err(SchedError::UnsupportedShell(_))
        ));
    }

    #[test]
    fn bash_rc_sources_user_rc_and_exports_gpus() {
        let rc = render_rc(
            ShellKind::Bash,
            Path::new("/home/o'brien/.bashrc"),
            "CUDA_VISIBLE_DEVICES",
            &[1, 3],
        );
        assert_eq!(
            rc,
            "if [ -f '/home/o'\\''brien/.bashrc' ]; then . '/home/o'\\''brien/.bashrc'; fi\n\
             export CUDA_VISIBLE_DEVICES=1,3\n\
             export CUDA_DEVICE_ORDER=PCI_BUS_ID\n"
        );
    }

    #[test]
    fn zsh_restores_zdotdir() {
        let rc = render_rc(
            ShellKind::Zsh,
            Path::new("/home/alice/.zshrc"),
            "CUDA_VISIBLE_DEVICES",
            &[0],
        );
        assert!(rc.starts_with("export ZDOTDIR='/home/alice'\n"));
        assert!(rc.contains("export CUDA_VISIBLE_DEVICES=0\n"));
    }

    #[test]
    fn bash_session_command() {
        let session = ShellSession::prepare(
            Path::new("/bin/bash"),
            Path::new("/home/alice"),
            "CUDA_VISIBLE_DEVICES",
            &[2],
        )
        .unwrap();
        let command = session.command();
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args[0], "--rcfile");
        let rc = std::fs::read_to_string(args[1]).unwrap();
        assert!(rc.contains("export CUDA_VISIBLE_DEVICES=2"));
    }

    #[test]
    fn fish_session_is_refused() {
        assert!(ShellSession::prepare(Path::new("/usr/bin/fish"), Path::new("/"), "X", &[0]).is_err());
    }
}

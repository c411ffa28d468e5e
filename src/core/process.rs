use std::path::PathBuf;
use std::process::Stdio;

fn managed_bin_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("mediafetch").join("bin"))
}

fn enhanced_path() -> Option<String> {
    let bin_dir = managed_bin_dir()?;
    let sep = if cfg!(windows) { ";" } else { ":" };
    let current = std::env::var("PATH").unwrap_or_default();
    Some(format!("{}{}{}", bin_dir.display(), sep, current))
}

/// Child command for external tools. The child is killed when its handle is
/// dropped, so aborting the owning task also stops the process.
pub fn command<S: AsRef<std::ffi::OsStr>>(program: S) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(target_os = "windows")]
    cmd.creation_flags(0x08000000);
    if let Some(path) = enhanced_path() {
        cmd.env("PATH", path);
    }
    cmd.env("PYTHONIOENCODING", "utf-8");
    cmd.env("PYTHONUTF8", "1");
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

pub async fn is_available(program: &str, version_arg: &str) -> bool {
    command(program)
        .arg(version_arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

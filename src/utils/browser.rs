//! Open the OAuth consent page in the default browser.

use tracing::debug;

/// Running under WSL, where Linux has no browser of its own.
#[cfg(target_os = "linux")]
fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|v| {
            let v = v.to_lowercase();
            v.contains("microsoft") || v.contains("wsl")
        })
        .unwrap_or(false)
}

/// Escape cmd.exe metacharacters so `start` receives the whole URL.
#[cfg(target_os = "linux")]
fn escape_for_cmd(url: &str) -> String {
    let mut escaped = String::with_capacity(url.len() + 8);
    for c in url.chars() {
        if matches!(c, '&' | '|' | '<' | '>' | '^') {
            escaped.push('^');
        }
        escaped.push(c);
    }
    escaped
}

/// Hand the URL to the Windows host from inside WSL.
#[cfg(target_os = "linux")]
fn open_from_wsl(url: &str) -> bool {
    use std::process::{Command, Stdio};

    // wslview ships with wslu; cmd.exe needs a Windows cwd to avoid UNC warnings
    Command::new("wslview").arg(url).spawn().is_ok()
        || Command::new("cmd.exe")
            .current_dir("/mnt/c/")
            .args(["/c", "start", "", &escape_for_cmd(url)])
            .stderr(Stdio::null())
            .spawn()
            .is_ok()
}

/// Launch `url` in the default browser. Returns `false` if no launcher started.
pub fn open_browser(url: &str) -> bool {
    #[cfg(target_os = "linux")]
    {
        if is_wsl() && open_from_wsl(url) {
            return true;
        }
    }

    match open::that_detached(url) {
        Ok(()) => true,
        Err(e) => {
            debug!("Browser launch failed: {}", e);
            false
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_is_wsl_does_not_panic() {
        let _ = is_wsl();
    }

    #[test]
    fn test_cmd_escaping_keeps_every_parameter() {
        let url = "https://accounts.google.com/o/oauth2/auth?client_id=x&redirect_uri=y&state=z";
        assert_eq!(
            escape_for_cmd(url),
            "https://accounts.google.com/o/oauth2/auth?client_id=x^&redirect_uri=y^&state=z"
        );
        assert_eq!(escape_for_cmd("a|b<c>d^e"), "a^|b^<c^>d^^e");
    }
}

//! Child-process helpers: windowless spawning and graceful termination.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// How a child process ended after [`terminate_gracefully`].
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before shutdown was requested.
    AlreadyExited(Option<i32>),
    /// The process exited on its own within the grace period.
    Graceful(Option<i32>),
    /// The grace period elapsed and the process was killed.
    Forced,
}

#[cfg(feature = "tokio")]
impl Termination {
    /// Whether the process had to be killed.
    pub fn was_forced(&self) -> bool {
        matches!(self, Termination::Forced)
    }
}

/// Ask a child to exit, then kill it if it is still alive after `grace`.
///
/// `quit` is written to the child's stdin (if it was piped) and stdin is
/// closed afterwards. Tools like ffmpeg finish the current output file when
/// they read `q`.
#[cfg(feature = "tokio")]
pub async fn terminate_gracefully(
    child: &mut tokio::process::Child,
    quit: &[u8],
    grace: std::time::Duration,
) -> std::io::Result<Termination> {
    use tokio::io::AsyncWriteExt;

    if let Some(status) = child.try_wait()? {
        return Ok(Termination::AlreadyExited(status.code()));
    }

    if let Some(mut stdin) = child.stdin.take() {
        // A broken pipe only means the child is already going away.
        let _ = stdin.write_all(quit).await;
        let _ = stdin.flush().await;
        drop(stdin);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(Termination::Graceful(status?.code())),
        Err(_) => {
            child.kill().await?;
            Ok(Termination::Forced)
        }
    }
}

#[cfg(all(test, unix, feature = "tokio"))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[tokio::test]
    async fn test_terminate_gracefully_closes_stdin() {
        // `cat` exits as soon as its stdin is closed.
        let mut child = tokio_command("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let outcome = terminate_gracefully(&mut child, b"q\n", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Graceful(Some(0)));
    }

    #[tokio::test]
    async fn test_terminate_gracefully_kills_after_grace() {
        let mut child = tokio_command("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();

        let outcome = terminate_gracefully(&mut child, b"q\n", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(outcome.was_forced());
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let mut child = tokio_command("true").spawn().unwrap();
        child.wait().await.unwrap();

        let outcome = terminate_gracefully(&mut child, b"q\n", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::AlreadyExited(Some(0)));
    }
}

//! Readiness detection over a diagnostic stream
//!
//! The external cluster tools announce readiness with unstructured text on
//! stderr rather than a structured API, so the supervisor scans the stream
//! line by line for known marker substrings. The legacy scan loop had no
//! timeout and hung if the process died quietly; here every wait is bounded
//! and end-of-stream is reported distinctly so the caller can attach the
//! process exit status.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

use crate::core::errors::{MusterError, Result};

/// Scan `lines` until `expected` lines satisfying `matches` have been seen,
/// in emission order. Returns the number of matching lines observed when the
/// wait ends early (stream closed), wrapped in the error.
pub async fn await_matching_lines<R, F>(
    lines: &mut Lines<BufReader<R>>,
    matches: F,
    expected: usize,
    wait: Duration,
    what: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: Fn(&str) -> bool,
{
    let scan = async {
        let mut seen = 0usize;
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| MusterError::io(format!("scanning output of {what}"), e))?;
            match line {
                Some(line) => {
                    tracing::trace!("{}: {}", what, line);
                    if matches(&line) {
                        seen += 1;
                        tracing::debug!("{}: readiness marker {}/{}", what, seen, expected);
                        if seen >= expected {
                            return Ok(());
                        }
                    }
                }
                None => {
                    return Err(MusterError::StreamClosed {
                        marker: what.to_string(),
                        seen,
                        expected,
                    })
                }
            }
        }
    };

    match tokio::time::timeout(wait, scan).await {
        Ok(result) => result,
        Err(_) => Err(MusterError::timeout(format!("readiness of {what}"), wait)),
    }
}

/// Substring-marker convenience over [`await_matching_lines`].
pub async fn await_marker<R>(
    lines: &mut Lines<BufReader<R>>,
    marker: &str,
    expected: usize,
    wait: Duration,
    what: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    await_matching_lines(lines, |line| line.contains(marker), expected, wait, what).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn lines_over(bytes: &'static [u8]) -> Lines<BufReader<&'static [u8]>> {
        BufReader::new(bytes).lines()
    }

    #[tokio::test]
    async fn finds_marker_among_noise() {
        let mut lines = lines_over(
            b"starting up\nbinding sockets\ncontroller: subscription started\nmore output\n",
        );
        await_marker(
            &mut lines,
            "subscription started",
            1,
            Duration::from_secs(1),
            "controller",
        )
        .await
        .unwrap();

        // The scan stops at the marker; the rest of the stream is untouched.
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "more output");
    }

    #[tokio::test]
    async fn counts_markers_in_emission_order() {
        let mut lines = lines_over(
            b"engine: Completed registration\nnoise\nengine: Completed registration\nengine: Completed registration\n",
        );
        await_marker(
            &mut lines,
            "Completed registration",
            3,
            Duration::from_secs(1),
            "engines",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn end_of_stream_reports_progress() {
        let mut lines = lines_over(b"engine: Completed registration\nshutting down\n");
        let err = await_marker(
            &mut lines,
            "Completed registration",
            4,
            Duration::from_secs(1),
            "engines",
        )
        .await
        .unwrap_err();
        match err {
            MusterError::StreamClosed { seen, expected, .. } => {
                assert_eq!(seen, 1);
                assert_eq!(expected, 4);
            }
            other => panic!("expected StreamClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_stream_times_out() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"still warming up\n").await.unwrap();

        let mut lines = BufReader::new(reader).lines();
        let err = await_marker(
            &mut lines,
            "ready",
            1,
            Duration::from_millis(50),
            "controller",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MusterError::Timeout { .. }));
        drop(writer);
    }

    #[tokio::test]
    async fn predicate_form_accepts_custom_matching() {
        let mut lines = lines_over(b"rank 0 ok\nrank 1 ok\n");
        await_matching_lines(
            &mut lines,
            |line| line.starts_with("rank") && line.ends_with("ok"),
            2,
            Duration::from_secs(1),
            "engines",
        )
        .await
        .unwrap();
    }
}

//! Line-oriented regular-expression substitution filter.

use std::sync::Arc;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::config::{ConfigError, Options};
use crate::exporter::ByteStream;
use crate::filter::Filter;
use crate::pipe::PipeWriter;

/// Filter driver `regexp`: applies `expr` -> `replace` to every line.
///
/// Lines are split on LF; a trailing CR is stripped, and output lines are
/// always LF-terminated.
pub struct RegexpFilter {
    regex: Regex,
    replace: String,
}

/// Construct from declaration options `expr` and `replace`.
pub(crate) fn new_regexp(options: &Options) -> Result<Arc<dyn Filter>, ConfigError> {
    let expr = options.get_str("expr").unwrap_or_default();
    let replace = options.get_str("replace").unwrap_or_default();
    Ok(Arc::new(RegexpFilter {
        regex: Regex::new(&expr)?,
        replace,
    }))
}

impl Filter for RegexpFilter {
    fn start(&self, mut dst: PipeWriter, src: ByteStream) {
        let regex = self.regex.clone();
        let replace = self.replace.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(src).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let mut out = regex.replace_all(&line, replace.as_str()).into_owned();
                        out.push('\n');
                        if let Err(e) = dst.write_all(out.as_bytes()).await {
                            warn!(error = %e, "regexp: downstream write failed");
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = dst.shutdown().await;
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "regexp: upstream read failed");
                        dst.close_with_error(e).await;
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use serde_json::json;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn regexp(options: serde_json::Value) -> Arc<dyn Filter> {
        new_regexp(&serde_json::from_value(options).unwrap()).unwrap()
    }

    async fn run_filter(filter: &dyn Filter, input: &[u8]) -> String {
        let (w, mut r) = pipe();
        filter.start(w, Box::new(Cursor::new(input.to_vec())));
        let mut out = String::new();
        r.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_substitutes_every_line() {
        let filter = regexp(json!({"expr": "foo", "replace": "bar"}));
        let out = run_filter(filter.as_ref(), b"foo\nfoo foo\n").await;
        assert_eq!(out, "bar\nbar bar\n");
    }

    #[tokio::test]
    async fn test_untouched_lines_pass_through() {
        let filter = regexp(json!({"expr": "secret=\\S+", "replace": "secret=***"}));
        let out = run_filter(filter.as_ref(), b"plain\nsecret=abc123\n").await;
        assert_eq!(out, "plain\nsecret=***\n");
    }

    #[tokio::test]
    async fn test_crlf_normalizes_to_lf() {
        let filter = regexp(json!({"expr": "", "replace": ""}));
        let out = run_filter(filter.as_ref(), b"a\r\nb\r\n").await;
        assert_eq!(out, "a\nb\n");
    }

    #[tokio::test]
    async fn test_capture_group_replacement() {
        let filter = regexp(json!({"expr": "^set (\\S+)", "replace": "SET $1"}));
        let out = run_filter(filter.as_ref(), b"set identity\n").await;
        assert_eq!(out, "SET identity\n");
    }

    #[tokio::test]
    async fn test_read_error_propagates_downstream() {
        let filter = regexp(json!({"expr": "x", "replace": "y"}));
        let (src_w, src_r) = pipe();
        let (dst_w, mut dst_r) = pipe();

        filter.start(dst_w, Box::new(src_r));
        src_w
            .close_with_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .await;

        let mut buf = Vec::new();
        let err = dst_r.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_bad_expression_is_config_error() {
        let err = new_regexp(&serde_json::from_value(json!({"expr": "("})).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Regex(_)));
    }
}

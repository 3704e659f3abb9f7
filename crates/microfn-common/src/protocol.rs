//! Result-framing protocol between a bootstrap script and its parent.
//!
//! The structured result travels out-of-band: the bootstrap writes exactly
//! one JSON document to [`RESULT_FILE_NAME`] inside the workspace, so user
//! output can never collide with result framing. The legacy in-band framing
//! (a [`RESULT_START`] line, one JSON document, a [`RESULT_END`] line on the
//! combined output stream) is still understood by the demultiplexer: framed
//! blocks are stripped from the log stream and used as the result when no
//! out-of-band file was produced.

/// Literal line opening an in-band result frame.
pub const RESULT_START: &str = "___RESULT_START___";
/// Literal line closing an in-band result frame.
pub const RESULT_END: &str = "___RESULT_END___";
/// Workspace-relative file the bootstrap writes its result document to.
pub const RESULT_FILE_NAME: &str = "__result__.json";

/// Combined child output split into log lines and at most one result frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DemuxedOutput {
    pub logs: Vec<String>,
    pub framed_result: Option<String>,
}

/// Split combined child output into (logs, in-band result).
///
/// Blank lines are dropped. Lines between the start/end sentinels are
/// accumulated into the result document and never surface as logs; the
/// sentinel lines themselves are consumed. Only the first complete frame is
/// kept, a bootstrap emits exactly one.
pub fn demux_lines<I>(lines: I) -> DemuxedOutput
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut out = DemuxedOutput::default();
    let mut frame: Option<Vec<String>> = None;

    for line in lines {
        let line = line.as_ref();
        let trimmed = line.trim_end_matches(['\r', '\n']);

        match (&mut frame, trimmed) {
            (None, RESULT_START) => frame = Some(Vec::new()),
            (Some(buf), RESULT_END) => {
                let document = buf.join("\n");
                if out.framed_result.is_none() {
                    out.framed_result = Some(document);
                }
                frame = None;
            }
            (Some(buf), other) => buf.push(other.to_string()),
            (None, other) => {
                if !other.trim().is_empty() {
                    out.logs.push(other.to_string());
                }
            }
        }
    }

    // An unterminated frame means the child died mid-emit; its partial
    // payload is not a result and must not leak into the logs either.
    out
}

//! 脚本错误堆栈格式化
//!
//! Turns a nested [`EvalAltResult`] into a readable trace:
//!
//! ```text
//! boom
//!     at explode (lib/util.rhai:4)
//!     at <module> (lib/util.rhai:9)
//! ```
//!
//! Frames are listed innermost first. Anonymous closures and the
//! bootstrap entry point are dropped; they only add noise for script
//! authors.

use rhai::{EvalAltResult, Position};

use super::RUN_ENTRY;

const ANONYMOUS_PREFIX: &str = "anon$";

struct Frame<'a> {
    name: &'a str,
    source: &'a str,
    position: Position,
}

impl Frame<'_> {
    fn is_hidden(&self) -> bool {
        self.name.is_empty() || self.name.starts_with(ANONYMOUS_PREFIX) || self.name == RUN_ENTRY
    }

    fn render(&self) -> String {
        let source = if self.source.is_empty() {
            "<script>"
        } else {
            self.source
        };
        match self.position.line() {
            Some(line) => format!("    at {} ({source}:{line})", self.name),
            None => format!("    at {} ({source})", self.name),
        }
    }
}

/// Format an interpreter error as message plus filtered call frames
pub fn format_stacktrace(err: &EvalAltResult) -> String {
    let mut frames = Vec::new();
    let mut current = err;
    loop {
        match current {
            EvalAltResult::ErrorInFunctionCall(name, source, inner, _) => {
                frames.push(Frame {
                    name,
                    source,
                    // where the fault happened inside this function
                    position: inner.position(),
                });
                current = inner.as_ref();
            }
            EvalAltResult::ErrorInModule(path, inner, _) => {
                frames.push(Frame {
                    name: "<module>",
                    source: path,
                    position: inner.position(),
                });
                current = inner.as_ref();
            }
            _ => break,
        }
    }

    let mut out = innermost_message(current);
    for frame in frames.iter().rev().filter(|frame| !frame.is_hidden()) {
        out.push('\n');
        out.push_str(&frame.render());
    }
    out
}

fn innermost_message(err: &EvalAltResult) -> String {
    match err {
        // thrown values and host errors carry their text as the value
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        other => other.to_string(),
    }
}

//! Per-runtime bootstrap generation.
//!
//! All spawn/capture/timeout/cleanup logic is shared; a [`LanguageRunner`]
//! supplies only the bootstrap template and the module/export convention of
//! its interpreter.

use microfn_common::RuntimeKind;

const HANDLER_TOKEN: &str = "__MICROFN_HANDLER__";

const PYTHON_BOOTSTRAP: &str = include_str!("../templates/runner.py");
const NODE_BOOTSTRAP: &str = include_str!("../templates/runner.js");

pub trait LanguageRunner: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Render the bootstrap script that loads the user module, invokes the
    /// named handler with the event, and emits exactly one result document.
    /// `handler` has been validated as an identifier before this point.
    fn bootstrap(&self, handler: &str) -> String;

    /// Rewrite user code so the named handler is reachable under this
    /// runtime's export convention. Used by the persistent runtime's
    /// write-code path; a no-op where the convention needs nothing.
    fn ensure_exported(&self, code: &str, handler: &str) -> String;
}

struct NodeRunner;

impl LanguageRunner for NodeRunner {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Js
    }

    fn bootstrap(&self, handler: &str) -> String {
        NODE_BOOTSTRAP.replace(HANDLER_TOKEN, handler)
    }

    fn ensure_exported(&self, code: &str, handler: &str) -> String {
        if code.contains("module.exports") || code.contains("exports.") {
            return code.to_string();
        }
        format!("{code}\nmodule.exports = {{ {handler} }};\n")
    }
}

struct PythonRunner;

impl LanguageRunner for PythonRunner {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Python
    }

    fn bootstrap(&self, handler: &str) -> String {
        PYTHON_BOOTSTRAP.replace(HANDLER_TOKEN, handler)
    }

    // Python handlers are plain top-level functions; nothing to export.
    fn ensure_exported(&self, code: &str, _handler: &str) -> String {
        code.to_string()
    }
}

pub fn runner_for(kind: RuntimeKind) -> &'static dyn LanguageRunner {
    match kind {
        RuntimeKind::Js => &NodeRunner,
        RuntimeKind::Python => &PythonRunner,
    }
}

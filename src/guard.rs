//! Guard-code injection for the subprocess backend.
//!
//! The injector prepends a shim to the user's source: a memory ceiling,
//! an import interceptor for blocklisted modules and, for JavaScript, a
//! self-terminating timer. User code is appended verbatim after the shim.
//!
//! This is a best-effort secondary control. String-level import interception
//! can be bypassed (reflection, `importlib` internals, dynamic ESM `import()`),
//! so it only ever runs underneath the OS limits applied by the backend.

use crate::request::{IsolationConstraints, Language};

/// Line written to stderr when the shim refuses an import.
pub const BLOCKED_IMPORT_MARKER: &str = "__SANDBOX_BLOCKED_IMPORT__:";

/// Line written to stderr when the shim's own timer fires.
pub const TIMEOUT_MARKER: &str = "__SANDBOX_TIMEOUT__:";

/// Exit code used by the self-terminating timer.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Prepend the guard shim for `language` to `user_code`.
///
/// Pure: the same inputs always produce the same output. Languages that are
/// served rather than executed come back unchanged.
pub fn inject(language: Language, user_code: &str, constraints: &IsolationConstraints) -> String {
    let prelude = match language {
        Language::Python => python_prelude(constraints),
        Language::Javascript => javascript_prelude(constraints),
        Language::Html | Language::React => return user_code.to_string(),
    };
    format!("{prelude}\n{user_code}")
}

/// Signal left on stderr by the shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardSignal {
    BlockedImport(String),
    SelfTimeout,
}

/// Split shim marker lines out of `stderr`.
///
/// Returns the first signal seen and stderr with marker lines removed.
pub fn scan(stderr: &str) -> (Option<GuardSignal>, String) {
    let mut signal = None;
    let mut cleaned = String::with_capacity(stderr.len());
    for line in stderr.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if let Some(module) = trimmed.strip_prefix(BLOCKED_IMPORT_MARKER) {
            signal.get_or_insert_with(|| GuardSignal::BlockedImport(module.to_string()));
        } else if trimmed.starts_with(TIMEOUT_MARKER) {
            signal.get_or_insert(GuardSignal::SelfTimeout);
        } else {
            cleaned.push_str(line);
        }
    }
    (signal, cleaned)
}

/// Render a string as a literal valid in both Python and JavaScript.
fn quoted(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn quoted_list<'a>(names: impl Iterator<Item = &'a String>) -> String {
    names.map(|n| quoted(n)).collect::<Vec<_>>().join(", ")
}

fn python_prelude(c: &IsolationConstraints) -> String {
    let blocked = quoted_list(c.blocked_modules.iter());
    let marker = quoted(BLOCKED_IMPORT_MARKER);
    let memory = c.max_memory_bytes;
    let cpu_soft = c.timeout_seconds + 1;
    let cpu_hard = c.timeout_seconds + 2;
    format!(
        r#"def __sandbox_guard(blocked, max_memory, cpu_limits, marker):
    import builtins, resource, sys
    for limit, value in ((resource.RLIMIT_AS, (max_memory, max_memory)), (resource.RLIMIT_CPU, cpu_limits)):
        try:
            resource.setrlimit(limit, value)
        except (ValueError, OSError):
            pass

    class BlockedImportError(ImportError):
        pass

    original_import = builtins.__import__

    def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
        if level == 0 and (globals is None or globals.get("__name__") == "__main__"):
            root = name.partition(".")[0]
            if root in blocked:
                sys.stderr.write(marker + root + "\n")
                sys.stderr.flush()
                raise BlockedImportError("module '%s' is blocked in this sandbox" % root)
        return original_import(name, globals, locals, fromlist, level)

    builtins.__import__ = guarded_import
    builtins.BlockedImportError = BlockedImportError

__sandbox_guard(frozenset([{blocked}]), {memory}, ({cpu_soft}, {cpu_hard}), {marker})
del __sandbox_guard"#
    )
}

fn javascript_prelude(c: &IsolationConstraints) -> String {
    let blocked = quoted_list(c.blocked_modules.iter());
    let marker = quoted(BLOCKED_IMPORT_MARKER);
    let timeout_marker = quoted(TIMEOUT_MARKER);
    let memory = c.max_memory_bytes;
    let timeout_ms = c.timeout_seconds.saturating_mul(1000);
    format!(
        r#"(() => {{
  const Module = require('module');
  const blocked = new Set([{blocked}]);
  class BlockedImportError extends Error {{
    constructor(name) {{
      super(`module '${{name}}' is blocked in this sandbox`);
      this.name = 'BlockedImportError';
    }}
  }}
  const originalLoad = Module._load;
  Module._load = function (request, ...rest) {{
    const root = String(request).replace(/^node:/, '').split('/')[0];
    if (blocked.has(root)) {{
      process.stderr.write({marker} + root + '\n');
      throw new BlockedImportError(root);
    }}
    return originalLoad.call(this, request, ...rest);
  }};
  globalThis.BlockedImportError = BlockedImportError;
  const memoryLimit = {memory};
  setInterval(() => {{
    if (process.memoryUsage().rss > memoryLimit) {{
      process.stderr.write('MemoryLimitError: resident memory exceeded ' + memoryLimit + ' bytes\n');
      process.exit(137);
    }}
  }}, 100).unref();
  setTimeout(() => {{
    process.stderr.write({timeout_marker} + '{timeout_ms}\n');
    process.exit({TIMEOUT_EXIT_CODE});
  }}, {timeout_ms}).unref();
}})();"#
    )
}

//! Composition of the script that actually runs.
//!
//! The composed file is `SHIM + "\n" + approved source`. The shim runs first
//! inside the same CommonJS module scope as the job and:
//!
//! 1. captures the real `require`, `process` and `Buffer` privately,
//! 2. replaces `console` with a forwarder to the observer's log endpoint,
//! 3. replaces `require` with a gate that only loads the whitelisted module,
//! 4. arms an unref'd timer that exits with [`SELF_TERMINATION_EXIT_CODE`],
//! 5. turns every name in [`NEUTRALIZED_GLOBALS`] on the real global object
//!    into a locked accessor that yields `undefined` when read from the job's
//!    own file,
//! 6. shadows the same names with `undefined` in the module scope.
//!
//! Because `var` declarations are hoisted, the shadowed globals are already
//! `undefined` when the shim starts; that is why it reaches `process` and
//! `Buffer` through the original `require` (a wrapper parameter, which a
//! `var` redeclaration does not reset) instead of by name.
//!
//! The accessors decide by the file of the first named stack frame above
//! them. Frames from the staged file get `undefined`, frames from other files
//! (the whitelisted module and its dependencies) or from `node:` internals get
//! the real value, and an undecidable stack gets `undefined`.
//! `Error.prepareStackTrace` is locked first so the job cannot forge frames.

use std::time::Duration;

use crate::config::GateConfig;

/// Exit code used by the shim's own deadline timer.
pub const SELF_TERMINATION_EXIT_CODE: i32 = 124;

/// Names bound to `undefined` before the job's code runs.
pub const NEUTRALIZED_GLOBALS: &[&str] = &[
    "process",
    "global",
    "globalThis",
    "module",
    "exports",
    "__filename",
    "__dirname",
    "Buffer",
    "eval",
    "Function",
    "fetch",
    "WebSocket",
    "XMLHttpRequest",
    "Reflect",
    "queueMicrotask",
];

const SHIM_TEMPLATE: &str = r#"var console = (function (load) {
  var proc = load("process");
  var Buf = load("buffer").Buffer;
  var endpoint = new URL({{LOG_ENDPOINT}});
  var transport = load(endpoint.protocol === "https:" ? "https" : "http");
  var deadline = load("timers").setTimeout(function () {
    proc.exit({{SELF_EXIT_CODE}});
  }, {{SELF_EXIT_MS}});
  deadline.unref();
  function render(value) {
    if (typeof value === "object" && value !== null) {
      try { return JSON.stringify(value); } catch (e) { return String(value); }
    }
    return String(value);
  }
  function send(args) {
    var body = JSON.stringify({ message: Array.prototype.map.call(args, render).join(" ") });
    try {
      var req = transport.request({
        hostname: endpoint.hostname,
        port: endpoint.port || undefined,
        path: endpoint.pathname + endpoint.search,
        method: "POST",
        headers: { "Content-Type": "application/json", "Content-Length": Buf.byteLength(body) }
      });
      req.on("error", function () {});
      req.end(body);
    } catch (e) {}
  }
  return {
    log: function () { send(arguments); },
    info: function () { send(arguments); },
    warn: function () { send(arguments); },
    error: function () { send(arguments); }
  };
})(require);
var require = (function (load, allowed) {
  return function (name) {
    if (name === allowed) { return load(name); }
    throw new Error("module not permitted: " + name);
  };
})(require, {{ALLOWED_MODULE}});
(function (g, jobFile, names) {
  var define = Object.defineProperty;
  var capture = Error.captureStackTrace;
  var inspecting = false;
  function format(error, frames) {
    if (inspecting) {
      return frames;
    }
    var text = String(error);
    for (var i = 0; i < frames.length; i++) {
      text += "\n    at " + frames[i];
    }
    return text;
  }
  define(Error, "prepareStackTrace", { value: format, writable: false, configurable: false });
  function internal(file) {
    return file[0] === "n" && file[1] === "o" && file[2] === "d" && file[3] === "e" && file[4] === ":";
  }
  function trusted(accessor) {
    if (inspecting) {
      return true;
    }
    var holder = {};
    var frames;
    inspecting = true;
    try {
      capture(holder, accessor);
      frames = holder.stack;
    } finally {
      inspecting = false;
    }
    if (typeof frames !== "object" || frames === null) {
      return false;
    }
    for (var i = 0; i < frames.length; i++) {
      var file = frames[i].getFileName();
      if (typeof file !== "string" || file === "") {
        continue;
      }
      return internal(file) || file !== jobFile;
    }
    return false;
  }
  function guard(name) {
    var real = g[name];
    define(g, name, {
      configurable: false,
      enumerable: false,
      get: function read() {
        return trusted(read) ? real : undefined;
      },
      set: function write(value) {
        if (trusted(write)) {
          real = value;
        }
      }
    });
  }
  for (var i = 0; i < names.length; i++) {
    guard(names[i]);
  }
})((function () { return this; })(), __filename, {{GUARDED_NAMES}});
"#;

/// A composed script ready for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub composed_source: String,
    pub timeout: Duration,
    approved_offset: usize,
}

impl ExecutionRequest {
    /// A request for a script that needs no shim.
    pub fn new(composed_source: impl Into<String>, timeout: Duration) -> Self {
        Self {
            composed_source: composed_source.into(),
            timeout,
            approved_offset: 0,
        }
    }

    /// Byte offset at which the approved job source begins.
    pub fn approved_offset(&self) -> usize {
        self.approved_offset
    }

    pub fn shim(&self) -> &str {
        &self.composed_source[..self.approved_offset.saturating_sub(1)]
    }

    pub fn approved_source(&self) -> &str {
        &self.composed_source[self.approved_offset..]
    }
}

/// Builds the shim once per configuration and prepends it to approved jobs.
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    shim: String,
    timeout: Duration,
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

impl EnvironmentBuilder {
    pub fn new(config: &GateConfig) -> Self {
        let timeout = config.sandbox.execution_timeout();
        let mut shim = SHIM_TEMPLATE
            .replace("{{LOG_ENDPOINT}}", &js_string(&config.queue.log_endpoint()))
            .replace(
                "{{ALLOWED_MODULE}}",
                &js_string(&config.policy.allowed_module),
            )
            .replace("{{GUARDED_NAMES}}", &serde_json::json!(NEUTRALIZED_GLOBALS).to_string())
            .replace("{{SELF_EXIT_MS}}", &timeout.as_millis().to_string())
            .replace(
                "{{SELF_EXIT_CODE}}",
                &SELF_TERMINATION_EXIT_CODE.to_string(),
            );
        for name in NEUTRALIZED_GLOBALS {
            shim.push_str(&format!("var {} = undefined;\n", name));
        }
        // The separator newline is added by compose().
        let shim = shim.trim_end_matches('\n').to_string();

        Self { shim, timeout }
    }

    pub fn shim(&self) -> &str {
        &self.shim
    }

    /// Prepend the shim to an approved job. The job text is copied verbatim.
    pub fn compose(&self, approved_source: &str) -> ExecutionRequest {
        let mut composed_source = String::with_capacity(self.shim.len() + 1 + approved_source.len());
        composed_source.push_str(&self.shim);
        composed_source.push('\n');
        let approved_offset = composed_source.len();
        composed_source.push_str(approved_source);

        ExecutionRequest {
            composed_source,
            timeout: self.timeout,
            approved_offset,
        }
    }
}

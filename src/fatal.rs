//! Abort protocol for broken runtime invariants.
//!
//! Fatal corruption (a stub sentinel read as a code size, a misaligned code
//! header, a PC outside every known code region, ...) is never recoverable.
//! The diagnostic is logged, pending output is flushed, the process-wide
//! abort hook runs if one is installed and the process aborts.

use std::fmt;
use std::io::Write;
use std::sync::OnceLock;

/// Context handed to the abort hook.
#[derive(Debug, Clone)]
pub struct FatalReport {
    pub file: &'static str,
    pub line: u32,
    pub message: String,
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.message)
    }
}

/// Called before the process aborts. A hook that diverges (exits, panics)
/// replaces the default abort.
pub type AbortHook = fn(&FatalReport);

static ABORT_HOOK: OnceLock<AbortHook> = OnceLock::new();

/// Install the process-wide abort hook. Returns false if one is already set.
pub fn set_abort_hook(hook: AbortHook) -> bool {
    ABORT_HOOK.set(hook).is_ok()
}

#[cold]
#[inline(never)]
pub fn abort(file: &'static str, line: u32, args: fmt::Arguments<'_>) -> ! {
    let report = FatalReport {
        file,
        line,
        message: args.to_string(),
    };

    let _ = std::io::stdout().flush();
    tracing::error!(file, line, "runtime aborting: {}", report.message);
    eprintln!("fatal: {}", report);
    let _ = std::io::stderr().flush();

    if let Some(hook) = ABORT_HOOK.get() {
        hook(&report);
    }
    std::process::abort()
}

/// Abort the process with file/line context.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::abort(file!(), line!(), format_args!($($arg)*))
    };
}

#[cfg(test)]
pub(crate) fn install_test_hook() {
    fn panic_hook(report: &FatalReport) {
        panic!("fatal: {}", report.message);
    }
    set_abort_hook(panic_hook);
}

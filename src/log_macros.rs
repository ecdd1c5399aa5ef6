//! Host-facing diagnostics.
//!
//! The teacher hand-rolls `info!`/`error!` over a framebuffer console
//! because it has no OS to hand a log line to. `bfs` runs hosted, so the
//! same macros retarget to stderr/stdout, but keep the optional leading
//! context literal the teacher's macros accept.

/// Prints an informational message, optionally tagged with a context.
#[macro_export]
macro_rules! info {
    ($ctx:literal, $($arg:tt)*) => {
        println!("[bfs] {}: {}", $ctx, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        println!("[bfs] {}", format_args!($($arg)*))
    };
}

/// Prints a warning message, optionally tagged with a context.
#[macro_export]
macro_rules! warn {
    ($ctx:literal, $($arg:tt)*) => {
        eprintln!("[bfs] warning: {}: {}", $ctx, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        eprintln!("[bfs] warning: {}", format_args!($($arg)*))
    };
}

/// Prints an error message, optionally tagged with a context.
#[macro_export]
macro_rules! error {
    ($ctx:literal, $($arg:tt)*) => {
        eprintln!("[bfs] error: {}: {}", $ctx, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        eprintln!("[bfs] error: {}", format_args!($($arg)*))
    };
}

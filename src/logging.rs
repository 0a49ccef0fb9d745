//! Bracket-tagged logging, the way the rest of this codebase has always
//! logged: `println!`/`eprintln!` with a `[Component]` prefix, no
//! external logging framework.

use chrono::Local;

pub fn info(tag: &str, msg: &str) {
    println!("[{}] {} {}", tag, Local::now().format("%H:%M:%S%.3f"), msg);
}

pub fn warn(tag: &str, msg: &str) {
    println!("[{}] WARN {} {}", tag, Local::now().format("%H:%M:%S%.3f"), msg);
}

pub fn error(tag: &str, msg: &str) {
    eprintln!("[{}] ERROR {} {}", tag, Local::now().format("%H:%M:%S%.3f"), msg);
}

#[macro_export]
macro_rules! log_info {
    ($tag:expr, $($arg:tt)*) => {
        $crate::logging::info($tag, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($tag:expr, $($arg:tt)*) => {
        $crate::logging::warn($tag, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($tag:expr, $($arg:tt)*) => {
        $crate::logging::error($tag, &format!($($arg)*))
    };
}

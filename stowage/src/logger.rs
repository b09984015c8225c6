use chrono::Local;
use std::fmt;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn emit(level: &str, args: fmt::Arguments) {
    let now = Local::now();
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => println!("[{}] {} [{}] {}", now.format(TIME_FORMAT), level, name, args),
        None => println!("[{}] {} {}", now.format(TIME_FORMAT), level, args),
    }
}

pub fn info(args: fmt::Arguments) {
    emit("INFO", args);
}

pub fn warn(args: fmt::Arguments) {
    emit("WARN", args);
}

pub fn error(args: fmt::Arguments) {
    emit("ERROR", args);
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logger::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logger::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logger::error(format_args!($($arg)*))
    };
}

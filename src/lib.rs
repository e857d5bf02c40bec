pub mod config;
pub mod error;
pub mod paths;
pub mod storage;
pub mod rules;
pub mod identity;
pub mod federation;
pub mod realtime;
pub mod server;

// Test-only printing helper: expands to eprintln! during tests and debug builds and is absent otherwise.
// Usage: tprintln!("debug: {}", value);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In release builds, provide a no-op tprintln! so calls compile without effect.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        // Preserve formatting checks in release without producing code
        if false { let _ = format!($($arg)*); }
    });
}

/// Milliseconds since the unix epoch, as used for `now` in rule expressions and account timestamps.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

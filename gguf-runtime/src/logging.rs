//! Forwarding of native library log lines into the `log` facade

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicI32, Ordering};

pub const GGML_LOG_LEVEL_NONE: i32 = 0;
pub const GGML_LOG_LEVEL_DEBUG: i32 = 1;
pub const GGML_LOG_LEVEL_INFO: i32 = 2;
pub const GGML_LOG_LEVEL_WARN: i32 = 3;
pub const GGML_LOG_LEVEL_ERROR: i32 = 4;
pub const GGML_LOG_LEVEL_CONT: i32 = 5;

/// Target used for every forwarded line
pub const NATIVE_LOG_TARGET: &str = "gguf_runtime::native";

/// Level of the last non-continuation line
static LAST_LEVEL: AtomicI32 = AtomicI32::new(GGML_LOG_LEVEL_INFO);

/// Map a native level to a `log` level. Continuation lines take the level
/// of the line they continue.
pub fn map_level(level: i32, previous: i32) -> log::Level {
    match level {
        GGML_LOG_LEVEL_CONT => map_level(previous, GGML_LOG_LEVEL_INFO),
        GGML_LOG_LEVEL_ERROR => log::Level::Error,
        GGML_LOG_LEVEL_WARN => log::Level::Warn,
        // The loader is chatty at INFO
        GGML_LOG_LEVEL_INFO => log::Level::Debug,
        GGML_LOG_LEVEL_DEBUG => log::Level::Trace,
        _ => log::Level::Info,
    }
}

/// Emit one native line through `log`
pub fn forward_line(level: i32, text: &str) {
    let previous = if level == GGML_LOG_LEVEL_CONT {
        LAST_LEVEL.load(Ordering::Relaxed)
    } else {
        LAST_LEVEL.store(level, Ordering::Relaxed);
        level
    };
    let text = text.trim_end_matches(['\n', '\r']);
    if text.is_empty() {
        return;
    }
    log::log!(target: NATIVE_LOG_TARGET, map_level(level, previous), "{}", text);
}

/// Callback installed with `llama_log_set`
///
/// # Safety
/// `text` must be null or a valid NUL-terminated string for the duration of the call.
pub(crate) unsafe extern "C" fn native_log_callback(level: c_int, text: *const c_char, _user_data: *mut c_void) {
    if text.is_null() {
        return;
    }
    let line = CStr::from_ptr(text).to_string_lossy();
    // Must not unwind into the native caller
    let _ = std::panic::catch_unwind(|| forward_line(level, &line));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(map_level(GGML_LOG_LEVEL_ERROR, GGML_LOG_LEVEL_INFO), log::Level::Error);
        assert_eq!(map_level(GGML_LOG_LEVEL_WARN, GGML_LOG_LEVEL_INFO), log::Level::Warn);
        assert_eq!(map_level(GGML_LOG_LEVEL_CONT, GGML_LOG_LEVEL_WARN), log::Level::Warn);
        assert_eq!(map_level(GGML_LOG_LEVEL_NONE, GGML_LOG_LEVEL_INFO), log::Level::Info);
    }

    #[test]
    fn test_forward_line_tracks_continuations() {
        let _ = env_logger::builder().is_test(true).try_init();
        forward_line(GGML_LOG_LEVEL_ERROR, "first part\n");
        forward_line(GGML_LOG_LEVEL_CONT, " continued\n");
        assert_eq!(LAST_LEVEL.load(Ordering::Relaxed), GGML_LOG_LEVEL_ERROR);
    }
}

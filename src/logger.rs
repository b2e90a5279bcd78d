//! Debug log for cati.
//!
//! Stdout is reserved for graphics frames and the terminal is in raw mode
//! while detection runs, so diagnostics go to a file instead. Nothing is
//! written unless `CATI_LOG` is set; `CATI_LOG_FILE` overrides the path.
use std::env;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use once_cell::sync::Lazy;

const DEFAULT_LOG_PATH: &str = "/tmp/cati.log";

static LOG_SINK: Lazy<Mutex<Option<File>>> = Lazy::new(|| Mutex::new(open_log_file()));

fn open_log_file() -> Option<File> {
    env::var_os("CATI_LOG")?;
    let path = env::var_os("CATI_LOG_FILE").unwrap_or_else(|| DEFAULT_LOG_PATH.into());
    OpenOptions::new().create(true).append(true).open(path).ok()
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::write_log(&format!($($arg)*))
    };
}

/// Append one timestamped line to the log file, if logging is enabled.
/// Write errors are ignored.
pub fn write_log(msg: &str) {
    let Ok(mut sink) = LOG_SINK.lock() else {
        return;
    };
    if let Some(file) = sink.as_mut() {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] {}", timestamp, msg);
        let _ = file.flush();
    }
}

/// Render bytes as `offset  hex  |ascii|` rows, 16 bytes per row
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, line) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", row * 16);
        for i in 0..16 {
            match line.get(i) {
                Some(b) => {
                    let _ = write!(out, " {:02x}", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        for &b in line {
            out.push(if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' });
        }
        out.push_str("|\n");
    }
    out
}

use lazy_static::lazy_static;
use regex::Regex;
use std::fs::File;
use std::path::Path;

lazy_static! {
    /// Regex for sanitizing sensitive values in log lines.
    ///
    /// Matches `key: value` / `key=value` pairs whose key looks like a
    /// credential or token and masks the value. Env override values resolved
    /// for a user flow through here too, so only variable names ever reach
    /// the log file.
    static ref SENSITIVE_REGEX: Regex = Regex::new(
        r#"(?i)(?P<key>["']?(?:api[_-]?key|authorization|bearer|token|secret|password|credential)["']?)(?P<sep>\s*[:=]\s*)(?P<q>["']?)(?P<val>[^"',\s}]+)"#
    )
    .unwrap();
}

/// Masks sensitive values in a log message, keeping a short prefix for
/// correlation.
pub fn replace_sensitive_info(message: &str) -> String {
    SENSITIVE_REGEX
        .replace_all(message, |caps: &regex::Captures| {
            let val = &caps["val"];
            let prefix: String = val.chars().take(4).collect();
            format!("{}{}{}{}******", &caps["key"], &caps["sep"], &caps["q"], prefix)
        })
        .to_string()
}

/// Simplifies file paths by extracting relevant parts from cargo registry paths.
fn simplify_file_path(file_path: &str) -> String {
    if let Some(pos) = file_path.rfind("/src/") {
        return file_path[(pos + 1)..].to_string();
    }
    if let Some((_, suffix)) = file_path.split_once(".cargo/registry/src/") {
        if let Some(first_slash) = suffix.find('/') {
            return suffix[(first_slash + 1)..].to_string();
        }
        return suffix.to_string();
    }
    file_path.to_string()
}

/// Formats log messages for console output with a simplified time format.
fn console_log_formatter(
    out: fern::FormatCallback,
    message: &std::fmt::Arguments,
    record: &log::Record,
) {
    let level_color = match record.level() {
        log::Level::Error => "\x1B[31m",
        log::Level::Warn => "\x1B[33m",
        log::Level::Info => "\x1B[32m",
        log::Level::Debug => "\x1B[0m",
        log::Level::Trace => "\x1B[35m",
    };
    let reset = "\x1B[0m";

    out.finish(format_args!(
        "{}{}[{}] {}:{} {}{}",
        level_color,
        chrono::Local::now().format("%H:%M:%S%.3f "),
        record.level(),
        simplify_file_path(record.file().unwrap_or("")),
        record.line().unwrap_or(0),
        replace_sensitive_info(&message.to_string()),
        reset,
    ))
}

/// Formats log messages for file output with the full date.
fn file_log_formatter(
    out: fern::FormatCallback,
    message: &std::fmt::Arguments,
    record: &log::Record,
) {
    out.finish(format_args!(
        "{}[{}] {}:{} {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f "),
        record.level(),
        simplify_file_path(record.file().unwrap_or("")),
        record.line().unwrap_or(0),
        replace_sensitive_info(&message.to_string()),
    ))
}

/// Installs the global fern logger.
///
/// Console logging is always on; when `log_dir` is set a `one-mcp.log` file
/// is written there as well. The level comes from the `PROXY_LOG` environment
/// variable (`error|warn|info|debug|trace`, default `info`).
pub fn setup_logger(log_dir: Option<&str>) -> Result<(), fern::InitError> {
    let level = match std::env::var("PROXY_LOG").as_deref() {
        Ok("error") => log::LevelFilter::Error,
        Ok("warn") => log::LevelFilter::Warn,
        Ok("debug") => log::LevelFilter::Debug,
        Ok("trace") => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    let console = fern::Dispatch::new()
        .format(console_log_formatter)
        .level(level)
        // Upstream HTTP machinery is chatty at debug; keep it at info.
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("reqwest", log::LevelFilter::Info)
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new().chain(console);

    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)?;
        let log_file: File = fern::log_file(Path::new(dir).join("one-mcp.log"))?;
        let file = fern::Dispatch::new()
            .format(file_log_formatter)
            .level(level)
            .chain(log_file);
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_api_keys() {
        let masked = replace_sensitive_info("calling with api_key=sk-abcdef123456");
        assert!(masked.contains("api_key=sk-a******"));
        assert!(!masked.contains("abcdef123456"));
    }

    #[test]
    fn leaves_plain_text_alone() {
        let line = "instance global-service-3-shared ready, 12 tools";
        assert_eq!(replace_sensitive_info(line), line);
    }

    #[test]
    fn simplifies_registry_paths() {
        assert_eq!(
            simplify_file_path(
                "/home/u/.cargo/registry/src/index.crates.io-abc/rmcp-0.8.5/src/lib.rs"
            ),
            "rmcp-0.8.5/src/lib.rs"
        );
    }
}

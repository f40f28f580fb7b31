use chrono::{Duration, Local};
use std::fs;
use std::panic;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志文件保留天数
pub const LOG_KEEP_DAYS: i64 = 5;

/// 初始化全局日志（整个进程只调用一次）
///
/// 同时输出到 stdout 与 `<log_dir>/logs/histo-tiler.log`（按天滚动）。
/// 可以通过 `RUST_LOG` 覆盖默认的过滤级别。
pub fn init_logging(log_dir: PathBuf) {
    let log_dir = log_dir.join("logs");
    if !log_dir.exists() {
        fs::create_dir_all(&log_dir).unwrap_or_else(|e| {
            eprintln!("Failed to create log directory: {}", e);
        });
    }

    clean_old_logs(&log_dir, LOG_KEEP_DAYS);

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "histo-tiler.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // guard 必须活到进程结束，否则文件日志会丢失
    Box::leak(Box::new(guard));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // 消息里已有 [组件] 前缀，终端上省略 target；
    // slide / tile_worker span 的字段会出现在每一行的前面
    let console = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false);
    // 文件里保留线程信息，便于区分同一切片的多个 worker
    let file = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_thread_names(true);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();

    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
        return;
    }

    setup_panic_hook();

    info!("Logging initialized. Logs are stored in: {:?}", log_dir);
}

/// 删除修改时间早于 `keep_days` 天的日志文件
pub fn clean_old_logs(log_dir: &Path, keep_days: i64) -> usize {
    let threshold = Local::now() - Duration::days(keep_days);
    let mut removed = 0;

    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let modified: chrono::DateTime<Local> = modified.into();
            if modified < threshold && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }

    removed
}

fn setup_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "no message"
        };

        error!("PANIC at {}: {}", location, message);
        eprintln!("PANIC at {}: {}", location, message);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_old_logs_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("histo-tiler.log.today");
        fs::write(&fresh, "hello").unwrap();

        let removed = clean_old_logs(dir.path(), LOG_KEEP_DAYS);
        assert_eq!(removed, 0);
        assert!(fresh.exists());
    }

    #[test]
    fn test_clean_old_logs_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(clean_old_logs(&dir.path().join("nope"), 1), 0);
    }
}

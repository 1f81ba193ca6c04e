use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub fn level_filter(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Builds the dispatcher and returns it together with the log file it writes to.
pub fn build_dispatch(log_dir: &Path, log_level: &str) -> Result<(fern::Dispatch, PathBuf)> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Clean up old log files, keeping only the most recent one
    cleanup_old_logs(log_dir)?;

    let log_file_name = format!("server_realtime_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level_filter(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?);

    Ok((dispatch, log_path))
}

pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<PathBuf> {
    let (dispatch, log_path) = build_dispatch(log_dir, log_level)?;
    dispatch.apply()?;
    Ok(log_path)
}

fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .map(|e| {
            let modified = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    // Keep the most recent one (index 0), delete the rest
    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn level_names() {
        assert_eq!(level_filter("TRACE"), log::LevelFilter::Trace);
        assert_eq!(level_filter("warn"), log::LevelFilter::Warn);
        assert_eq!(level_filter("nonsense"), log::LevelFilter::Info);
    }

    #[test]
    fn only_the_newest_old_log_survives() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("server_realtime_old.log");
        let newer = dir.path().join("server_realtime_new.log");
        let unrelated = dir.path().join("notes.txt");
        fs::write(&older, "old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&newer, "new").unwrap();
        fs::write(&unrelated, "keep").unwrap();

        let (_dispatch, log_path) = build_dispatch(dir.path(), "debug").unwrap();

        assert!(!older.exists());
        assert!(newer.exists());
        assert!(unrelated.exists());
        assert!(log_path.exists());
        assert!(log_path.file_name().unwrap().to_str().unwrap().starts_with("server_realtime_"));
    }

    #[test]
    fn missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let (_dispatch, log_path) = build_dispatch(&nested, "info").unwrap();
        assert!(nested.is_dir());
        assert!(log_path.starts_with(&nested));
    }
}

use crate::error::Error;
use crate::logger::Logger;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One per-port row in the post-run report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub origin: String,
    pub flavor: String,
    pub version: String,
    pub status: String,
    pub reason: String,
    pub uuid: String,
    pub elapsed_secs: f64,
}

fn sanitize_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Write the JSON and CSV reports under the logs directory and return
/// their paths.
pub fn write_reports(
    entries: &[ReportEntry],
    logs_path: &Path,
    stem_hint: &str,
    logger: &dyn Logger,
) -> Result<(PathBuf, PathBuf), Error> {
    fs::create_dir_all(logs_path)
        .map_err(|err| Error::io(format!("creating {}", logs_path.display()), err))?;
    let stem = if entries.len() == 1 {
        sanitize_stem(&entries[0].origin)
    } else {
        sanitize_stem(stem_hint)
    };
    let json_path = logs_path.join(format!("build_{stem}.json"));
    let csv_path = logs_path.join(format!("build_{stem}.csv"));

    let payload = serde_json::to_vec_pretty(entries)
        .map_err(|err| Error::Validation(format!("serializing report: {err}")))?;
    fs::write(&json_path, payload)
        .map_err(|err| Error::io(format!("writing {}", json_path.display()), err))?;

    let mut writer = csv::Writer::from_path(&csv_path)
        .map_err(|err| Error::Validation(format!("opening {}: {err}", csv_path.display())))?;
    for entry in entries {
        writer
            .serialize(entry)
            .map_err(|err| Error::Validation(format!("writing report row: {err}")))?;
    }
    writer
        .flush()
        .map_err(|err| Error::io(format!("flushing {}", csv_path.display()), err))?;

    logger.info(&format!(
        "phase=report status=written json={} csv={}",
        json_path.display(),
        csv_path.display()
    ));
    Ok((json_path, csv_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogger;

    #[test]
    fn reports_are_written_as_json_and_csv() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = vec![
            ReportEntry {
                origin: "print/indexinfo".to_string(),
                flavor: String::new(),
                version: "0.3.1".to_string(),
                status: "success".to_string(),
                reason: String::new(),
                uuid: "0".repeat(36),
                elapsed_secs: 1.5,
            },
            ReportEntry {
                origin: "misc/help2man".to_string(),
                flavor: String::new(),
                version: "1.49.3".to_string(),
                status: "skipped".to_string(),
                reason: "prerequisite print/indexinfo failed".to_string(),
                uuid: String::new(),
                elapsed_secs: 0.0,
            },
        ];
        let logger = MemoryLogger::new();
        let (json_path, csv_path) =
            write_reports(&entries, dir.path(), "batch_2", &logger).expect("write");
        assert!(json_path.ends_with("build_batch_2.json"));
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(
            &std::fs::read(&json_path).expect("read json"),
        )
        .expect("parse json");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["status"], "success");
        let csv = std::fs::read_to_string(&csv_path).expect("read csv");
        assert!(csv.lines().count() >= 3, "header plus two rows");
        assert!(csv.contains("misc/help2man"));
    }

    #[test]
    fn single_entry_reports_use_the_origin_as_stem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = vec![ReportEntry {
            origin: "print/indexinfo".to_string(),
            flavor: String::new(),
            version: "0.3.1".to_string(),
            status: "success".to_string(),
            reason: String::new(),
            uuid: String::new(),
            elapsed_secs: 0.1,
        }];
        let logger = MemoryLogger::new();
        let (json_path, _) = write_reports(&entries, dir.path(), "ignored", &logger).expect("write");
        assert!(json_path.ends_with("build_print_indexinfo.json"));
    }
}

use std::io::Write;

use tabwriter::TabWriter;

use super::record::{ContainerStatus, Records};
use crate::core::{cmd::PSArgs, StatePaths};

/// Render known containers as a table, only running ones unless `--all`.
pub fn list_containers(ps_args: PSArgs, paths: &StatePaths) -> anyhow::Result<String> {
    let records = Records::new(paths).list()?;

    let mut tw = TabWriter::new(vec![]);
    let _ = tw.write_all(b"ID\tNAME\tPID\tIP\tSTATUS\tCOMMAND\n");

    for record in records {
        let status = record.observed_status();
        if !ps_args.all && status != ContainerStatus::Running {
            continue;
        }

        let ip = record
            .endpoint
            .as_ref()
            .map_or_else(|| "-".to_string(), |endpoint| endpoint.ip.to_string());
        let short_id: String = record.id.chars().take(12).collect();
        let _ = writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{:?}\t{}",
            short_id,
            record.name,
            record.pid,
            ip,
            status,
            record.command.join(" ")
        );
    }

    let _ = tw.flush();
    let buf = tw
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to render table: {}", e.error()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::core::container::ContainerRecord;

    #[test]
    fn test_list_containers() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        let records = Records::new(&paths);

        let running = ContainerRecord::new(
            "0123456789abcdef",
            "web",
            std::process::id() as i32,
            vec!["sleep".to_string(), "30".to_string()],
            vec![],
        );
        let mut stopped = ContainerRecord::new("fedcba9876543210", "old", 0, vec!["true".to_string()], vec![]);
        stopped.status = ContainerStatus::Stopped;
        records.register(&running).unwrap();
        records.register(&stopped).unwrap();

        let table = list_containers(PSArgs { all: false }, &paths).unwrap();
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].contains("0123456789ab "));
        assert!(lines[1].contains("Running"));
        assert!(lines[1].contains("sleep 30"));

        let table = list_containers(PSArgs { all: true }, &paths).unwrap();
        assert_eq!(table.lines().count(), 3);
        assert!(table.contains("old"));
        assert!(table.contains("Stopped"));
    }

    #[test]
    fn test_list_without_containers() {
        let dir = TempDir::new().unwrap();

        let table = list_containers(PSArgs { all: true }, &StatePaths::new(dir.path())).unwrap();
        assert_eq!(table.lines().count(), 1);
    }
}

/*!
Scheduling of periodic backups through a cron table.

Each job is a pair of lines: a marker comment `# dumpvault:<name>` directly
followed by the cron entry `<schedule> <command>`. Lines that do not belong
to a dumpvault job are preserved as they are. Single-writer usage is assumed;
concurrent edits of one table need external serialization.
*/

use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::process::{ProcessRunner, ToolCommand};
use crate::{Result, VaultError};

/// Prefix of the marker line tagging a job entry
pub const JOB_MARKER: &str = "# dumpvault:";

/// A scheduled backup as found in the table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJob {
    pub name: String,
    pub schedule: String,
    pub command: String,
}

/// Storage for the raw text of a cron table
pub trait JobTable {
    /// Current table contents; an absent table reads as empty
    fn read(&self) -> Result<String>;

    /// Replace the table contents
    fn write(&self, contents: &str) -> Result<()>;
}

/// The invoking user's crontab, edited through `crontab(1)`
#[derive(Debug, Clone)]
pub struct CrontabTable {
    base: ToolCommand,
    runner: ProcessRunner,
}

impl CrontabTable {
    pub fn new() -> Self {
        Self::with_command(ToolCommand::new("crontab"))
    }

    /// Use a different `crontab`-compatible command; `-l` or the file to
    /// install is appended to it
    pub fn with_command(base: ToolCommand) -> Self {
        Self {
            base,
            runner: ProcessRunner::new(),
        }
    }
}

impl Default for CrontabTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable for CrontabTable {
    fn read(&self) -> Result<String> {
        let output = self.runner.run(&self.base.clone().arg("-l"))?;
        if output.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        // crontab -l exits 1 with "no crontab for <user>" when none is installed
        if output.stderr.to_lowercase().contains("no crontab") {
            debug!("No crontab installed yet");
            return Ok(String::new());
        }
        Err(VaultError::execution(
            self.base.program(),
            format!("{}: {}", output.status, output.stderr.trim()),
        ))
    }

    fn write(&self, contents: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("dumpvault-crontab-")
            .tempfile()
            .map_err(|e| VaultError::io("create temporary crontab", e))?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| VaultError::io("write temporary crontab", e))?;

        self.runner.run_checked(&self.base.clone().arg(file.path()))?;
        Ok(())
    }
}

/// A cron table kept in a plain file, e.g. under `/etc/cron.d`
#[derive(Debug, Clone)]
pub struct FileJobTable {
    path: PathBuf,
}

impl FileJobTable {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobTable for FileJobTable {
    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(VaultError::io(format!("read {}", self.path.display()), e)),
        }
    }

    fn write(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    VaultError::io(format!("create directory {}", parent.display()), e)
                })?;
            }
        }
        fs::write(&self.path, contents)
            .map_err(|e| VaultError::io(format!("write {}", self.path.display()), e))
    }
}

/// Registers, removes and lists periodic backup jobs
pub trait JobScheduler {
    /// Install a job, replacing any existing job with the same name
    fn add_job(&self, name: &str, schedule: &str, command: &str) -> Result<()>;

    /// Remove a job; removing an unknown name succeeds without changes
    fn remove_job(&self, name: &str) -> Result<()>;

    fn list_jobs(&self) -> Result<Vec<ScheduledJob>>;
}

/// [`JobScheduler`] over a textual cron table
#[derive(Debug, Clone)]
pub struct CronScheduler<T: JobTable> {
    table: T,
}

impl<T: JobTable> CronScheduler<T> {
    pub fn new(table: T) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &T {
        &self.table
    }
}

impl CronScheduler<CrontabTable> {
    /// Scheduler over the invoking user's crontab
    pub fn user_crontab() -> Self {
        Self::new(CrontabTable::new())
    }
}

fn marker_name(line: &str) -> Option<&str> {
    line.trim().strip_prefix(JOB_MARKER).map(str::trim)
}

/// Table lines with the named job's marker and entry removed
fn without_job<'a>(contents: &'a str, name: &str) -> (Vec<&'a str>, bool) {
    let mut kept = Vec::new();
    let mut removed = false;
    let mut lines = contents.lines().peekable();

    while let Some(line) = lines.next() {
        if marker_name(line) == Some(name) {
            removed = true;
            if let Some(next) = lines.peek() {
                if marker_name(next).is_none() {
                    lines.next();
                }
            }
            continue;
        }
        kept.push(line);
    }
    (kept, removed)
}

fn render(lines: &[&str]) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Split a cron entry into schedule and command
fn split_entry(entry: &str) -> (String, String) {
    let fields = if entry.trim_start().starts_with('@') { 1 } else { 5 };
    let mut rest = entry.trim();
    let mut schedule = Vec::with_capacity(fields);
    for _ in 0..fields {
        match rest.split_once(char::is_whitespace) {
            Some((field, tail)) => {
                schedule.push(field);
                rest = tail.trim_start();
            }
            None => {
                schedule.push(rest);
                rest = "";
                break;
            }
        }
    }
    (schedule.join(" "), rest.to_string())
}

/// Job names key table entries, so they must fit on the marker line
pub fn validate_job_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VaultError::configuration("job name must not be empty"));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(VaultError::configuration(format!(
            "job name '{}' must not contain whitespace or control characters",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Accept `@keyword` schedules or five cron fields
pub fn validate_schedule(schedule: &str) -> Result<()> {
    if schedule.chars().any(char::is_control) {
        return Err(VaultError::configuration(
            "schedule must not contain control characters",
        ));
    }
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let valid = match fields.as_slice() {
        [keyword] => keyword.starts_with('@') && keyword.len() > 1,
        fields => fields.len() == 5,
    };
    if !valid {
        return Err(VaultError::configuration(format!(
            "invalid cron schedule '{schedule}': expected five fields or an @keyword"
        )));
    }
    Ok(())
}

impl<T: JobTable> JobScheduler for CronScheduler<T> {
    fn add_job(&self, name: &str, schedule: &str, command: &str) -> Result<()> {
        validate_job_name(name)?;
        validate_schedule(schedule)?;
        if command.trim().is_empty() || command.contains('\n') || command.contains('\r') {
            return Err(VaultError::configuration(
                "job command must be a single non-empty line",
            ));
        }

        let current = self.table.read()?;
        let (mut lines, replaced) = without_job(&current, name);
        let marker = format!("{JOB_MARKER}{name}");
        let schedule = schedule.split_whitespace().collect::<Vec<_>>().join(" ");
        let entry = format!("{schedule} {}", command.trim());
        lines.push(&marker);
        lines.push(&entry);

        self.table.write(&render(&lines))?;
        info!(job = %name, schedule = %schedule, replaced = replaced, "Scheduled backup job");
        Ok(())
    }

    fn remove_job(&self, name: &str) -> Result<()> {
        let current = self.table.read()?;
        let (lines, removed) = without_job(&current, name);
        if !removed {
            debug!(job = %name, "No scheduled job to remove");
            return Ok(());
        }
        self.table.write(&render(&lines))?;
        info!(job = %name, "Removed scheduled backup job");
        Ok(())
    }

    fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let contents = self.table.read()?;
        let mut jobs = Vec::new();
        let mut lines = contents.lines().peekable();

        while let Some(line) = lines.next() {
            let Some(name) = marker_name(line) else {
                continue;
            };
            let entry = match lines.peek() {
                Some(next) if marker_name(next).is_none() => lines.next().unwrap_or_default(),
                _ => "",
            };
            let (schedule, command) = split_entry(entry);
            jobs.push(ScheduledJob {
                name: name.to_string(),
                schedule,
                command,
            });
        }
        Ok(jobs)
    }
}

/// Quote a word for `sh`, leaving plain words untouched
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Command line that re-invokes the binary to back up `database`, appending
/// its output to `log_path`.
///
/// `%` is escaped because cron turns a bare `%` into a newline.
pub fn backup_command(binary: &Path, config_path: &Path, database: &str, log_path: &Path) -> String {
    let line = format!(
        "{} --config {} backup {} >> {} 2>&1",
        shell_quote(&binary.to_string_lossy()),
        shell_quote(&config_path.to_string_lossy()),
        shell_quote(database),
        shell_quote(&log_path.to_string_lossy()),
    );
    line.replace('%', r"\%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_scheduler(dir: &TempDir) -> CronScheduler<FileJobTable> {
        CronScheduler::new(FileJobTable::new(dir.path().join("crontab")))
    }

    #[test]
    fn test_add_list_remove() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = file_scheduler(&temp_dir);

        scheduler
            .add_job("orders", "0 2 * * *", "/usr/bin/dumpvault backup orders")
            .unwrap();

        let jobs = scheduler.list_jobs().unwrap();
        assert_eq!(
            jobs,
            vec![ScheduledJob {
                name: "orders".to_string(),
                schedule: "0 2 * * *".to_string(),
                command: "/usr/bin/dumpvault backup orders".to_string(),
            }]
        );

        let contents = fs::read_to_string(scheduler.table().path()).unwrap();
        assert_eq!(
            contents,
            "# dumpvault:orders\n0 2 * * * /usr/bin/dumpvault backup orders\n"
        );

        scheduler.remove_job("orders").unwrap();
        assert!(scheduler.list_jobs().unwrap().is_empty());
        assert!(!fs::read_to_string(scheduler.table().path())
            .unwrap()
            .contains("orders"));
    }

    #[test]
    fn test_add_overwrites_existing_job() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = file_scheduler(&temp_dir);

        scheduler.add_job("orders", "0 2 * * *", "backup v1").unwrap();
        scheduler.add_job("orders", "30 3 * * 1", "backup v2").unwrap();

        let jobs = scheduler.list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule, "30 3 * * 1");
        assert_eq!(jobs[0].command, "backup v2");
    }

    #[test]
    fn test_remove_unknown_job_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = file_scheduler(&temp_dir);

        scheduler.remove_job("ghost").unwrap();
        assert!(!scheduler.table().path().exists());

        scheduler.add_job("orders", "@daily", "backup orders").unwrap();
        scheduler.remove_job("ghost").unwrap();
        assert_eq!(scheduler.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_exact_name_matching() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = file_scheduler(&temp_dir);

        scheduler.add_job("orders", "0 1 * * *", "backup orders").unwrap();
        scheduler
            .add_job("orders_archive", "0 4 * * *", "backup orders_archive")
            .unwrap();

        scheduler.remove_job("orders").unwrap();

        let jobs = scheduler.list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "orders_archive");
        assert_eq!(jobs[0].command, "backup orders_archive");
    }

    #[test]
    fn test_foreign_lines_preserved() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = file_scheduler(&temp_dir);
        fs::write(
            scheduler.table().path(),
            "MAILTO=ops@example.com\n# rotate logs\n0 0 * * * /usr/sbin/logrotate\n",
        )
        .unwrap();

        scheduler.add_job("orders", "0 2 * * *", "backup orders").unwrap();
        scheduler.remove_job("orders").unwrap();

        assert_eq!(
            fs::read_to_string(scheduler.table().path()).unwrap(),
            "MAILTO=ops@example.com\n# rotate logs\n0 0 * * * /usr/sbin/logrotate\n"
        );
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = file_scheduler(&temp_dir);

        for name in ["", "two words", "tab\tname", "new\nline"] {
            let err = scheduler.add_job(name, "0 2 * * *", "backup").unwrap_err();
            assert!(matches!(err, VaultError::Configuration(_)), "name {name:?}");
        }
        assert!(scheduler.add_job("orders", "0 2 * *", "backup").is_err());
        assert!(scheduler.add_job("orders", "@", "backup").is_err());
        assert!(scheduler.add_job("orders", "0 2 * * *", "").is_err());
        assert!(scheduler.add_job("orders", "0 2 * * *", "a\nb").is_err());
        assert!(!scheduler.table().path().exists());
    }

    #[test]
    fn test_split_entry() {
        assert_eq!(
            split_entry("*/15 1-5 * * mon-fri run  --flag"),
            ("*/15 1-5 * * mon-fri".to_string(), "run  --flag".to_string())
        );
        assert_eq!(
            split_entry("@hourly run"),
            ("@hourly".to_string(), "run".to_string())
        );
        assert_eq!(split_entry(""), (String::new(), String::new()));
    }

    #[test]
    fn test_backup_command_quoting() {
        let command = backup_command(
            Path::new("/usr/local/bin/dumpvault"),
            Path::new("/etc/dumpvault/db config.yaml"),
            "orders",
            Path::new("/var/log/dumpvault-%Y.log"),
        );
        assert_eq!(
            command,
            r"/usr/local/bin/dumpvault --config '/etc/dumpvault/db config.yaml' backup orders >> '/var/log/dumpvault-\%Y.log' 2>&1"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[cfg(unix)]
    #[test]
    fn test_crontab_table_with_fake_program() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("installed");
        let program = temp_dir.path().join("fake-crontab");
        fs::write(
            &program,
            format!(
                "#!/bin/sh\nif [ \"$1\" = \"-l\" ]; then\n  if [ -f '{0}' ]; then cat '{0}'; else echo 'no crontab for tester' >&2; exit 1; fi\nelse\n  cp \"$1\" '{0}'\nfi\n",
                store.display()
            ),
        )
        .unwrap();

        let table = CrontabTable::with_command(ToolCommand::new("sh").arg(&program));
        assert_eq!(table.read().unwrap(), "");

        let scheduler = CronScheduler::new(table);
        scheduler.add_job("orders", "0 2 * * *", "backup orders").unwrap();
        assert_eq!(
            fs::read_to_string(&store).unwrap(),
            "# dumpvault:orders\n0 2 * * * backup orders\n"
        );
        assert_eq!(scheduler.list_jobs().unwrap()[0].name, "orders");
    }
}

//! Operator command surface.
//!
//! Parsing is kept separate from execution so the console (or anything else
//! holding a line of text) can validate input without touching the gateway.

use crate::context::GatewayContext;
use crate::outbound;
use crate::session::SessionInfo;
use chrono::{DateTime, Local, TimeZone, Utc};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use thermgate_protocol::{Reading, SensorId};
use thermgate_storage::StorageError;
use thiserror::Error;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const STATS_RULE: &str =
    "+------+-------------------+-------+------------+---------------------+---------------------+";

/// Commands and their parameter counts.
const COMMANDS: &[(&str, usize)] = &[
    ("connect", 2),
    ("terminate", 1),
    ("log", 0),
    ("clearlog", 0),
    ("status", 0),
    ("stats", 0),
    ("readdb", 0),
    ("help", 0),
    ("quit", 0),
    ("exit", 0),
];

pub const HELP_TEXT: &str = r#"
Available commands:
  connect <ip> <port>     Open an outbound link to a sensor node
  terminate <sensor_id>   Close a sensor session
  stats                   List active connections
  status                  Show gateway status and resource usage
  readdb                  Print persisted readings
  log                     Print the log file
  clearlog                Truncate the log file
  help                    Show this help
  quit, exit              Stop the gateway
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { ip: Ipv4Addr, port: u16 },
    Terminate(SensorId),
    Log,
    ClearLog,
    Status,
    Stats,
    ReadDb,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command '{0}'")]
    Unknown(String),

    #[error("Command '{name}' expects {expected} parameters, got {got}")]
    WrongArity {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Invalid port number. Must be between 1 and 65535")]
    InvalidPort,

    #[error("Invalid ip address")]
    InvalidIp,

    #[error("Port {0} already running")]
    PortAlreadyRunning(u16),

    #[error("Invalid sensor id '{0}'")]
    InvalidSensorId(String),
}

impl Command {
    /// Parses one console line. `running_port` is the gateway's own
    /// listening port, which `connect` refuses to target.
    pub fn parse(input: &str, running_port: u16) -> Result<Command, CommandError> {
        let words: Vec<&str> = input.split_whitespace().collect();
        let Some((first, args)) = words.split_first() else {
            return Err(CommandError::Empty);
        };

        let name = first.to_lowercase();
        let &(name, expected) = COMMANDS
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| CommandError::Unknown(input.trim().to_string()))?;
        if args.len() != expected {
            return Err(CommandError::WrongArity {
                name,
                expected,
                got: args.len(),
            });
        }

        match name {
            "connect" => parse_connect(args[0], args[1], running_port),
            "terminate" => args[0]
                .parse::<SensorId>()
                .map(Command::Terminate)
                .map_err(|_| CommandError::InvalidSensorId(args[0].to_string())),
            "log" => Ok(Command::Log),
            "clearlog" => Ok(Command::ClearLog),
            "status" => Ok(Command::Status),
            "stats" => Ok(Command::Stats),
            "readdb" => Ok(Command::ReadDb),
            "help" => Ok(Command::Help),
            _ => Ok(Command::Quit),
        }
    }
}

/// Port is checked before the address, then against the running port.
fn parse_connect(ip: &str, port: &str, running_port: u16) -> Result<Command, CommandError> {
    let port = match port.parse::<i64>() {
        Ok(p) if (1..=i64::from(u16::MAX)).contains(&p) => p as u16,
        _ => return Err(CommandError::InvalidPort),
    };
    let ip: Ipv4Addr = ip.parse().map_err(|_| CommandError::InvalidIp)?;
    if port == running_port {
        return Err(CommandError::PortAlreadyRunning(port));
    }
    Ok(Command::Connect { ip, port })
}

/// Runs a parsed command against the gateway and returns the text to show.
/// `None` means the operator asked to stop.
pub async fn execute(
    ctx: &Arc<GatewayContext>,
    command: Command,
) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
    let output = match command {
        Command::Quit => return Ok(None),
        Command::Help => HELP_TEXT.to_string(),
        Command::Connect { ip, port } => {
            tracing::info!("Connecting to {}:{}", ip, port);
            let sensor_id = outbound::connect(ctx.clone(), ip, port).await?;
            format!("Connected to {}:{} (ID: {})", ip, port, sensor_id)
        }
        Command::Terminate(sensor_id) => match ctx.table.remove(sensor_id) {
            Some(_) => {
                tracing::info!("A sensor node with {} has closed the connection", sensor_id);
                ctx.with_metrics(|m| m.sessions_active.set(f64::from(ctx.table.active_count())));
                format!("Sensor {} terminated", sensor_id)
            }
            None => format!("Sensor {} not found", sensor_id),
        },
        Command::Stats => render_stats(ctx.table.active_count(), &ctx.table.snapshot_for_display()),
        Command::Status => render_status(ctx),
        Command::ReadDb => {
            let storage = ctx.storage.clone();
            match tokio::task::spawn_blocking(move || storage.read_all()).await? {
                Ok(rows) => render_readings(&rows),
                Err(StorageError::NotConnected) => {
                    tracing::warn!("Cannot print DB. SQL not connected.");
                    "Database not connected.".to_string()
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Log => match ctx.config.logging.file.as_deref() {
            Some(path) => read_log(path)?,
            None => "File logging is disabled".to_string(),
        },
        Command::ClearLog => match ctx.config.logging.file.as_deref() {
            Some(path) => {
                clear_log(path)?;
                tracing::info!("Log file has been cleared");
                "Log cleared".to_string()
            }
            None => "File logging is disabled".to_string(),
        },
    };
    Ok(Some(output))
}

fn local_time<Tz: TimeZone>(at: &DateTime<Tz>) -> String {
    at.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

/// Table of sessions, newest first.
pub fn render_stats(active: u32, sessions: &[SessionInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== ACTIVE CONNECTIONS ({}) ===", active);
    let _ = writeln!(out, "{}", STATS_RULE);
    let _ = writeln!(
        out,
        "|  ID  |      IP Address   | Port  |   Status   |    Connected Time   |   Last Active Time  |"
    );
    let _ = writeln!(out, "{}", STATS_RULE);
    for s in sessions {
        let _ = writeln!(
            out,
            "| {:>4} | {:>17} | {:>5} | {:>10} | {:>19} | {:>19} |",
            s.sensor_id.get(),
            s.address,
            s.port,
            s.status,
            local_time(&s.connected_at),
            local_time(&s.last_active),
        );
    }
    out.push_str(STATS_RULE);
    out
}

fn render_status(ctx: &GatewayContext) -> String {
    let mut out = String::from("[System Status]\n");
    let _ = writeln!(out, "Active connections       : {}", ctx.table.active_count());
    let _ = writeln!(
        out,
        "Total messages received  : {} (live buffer: {})",
        ctx.storage.delivered_total(),
        ctx.storage.pending_len()
    );
    let _ = writeln!(out, "Database                 : {}", ctx.storage.status());
    match memory_usage_mb() {
        Some((used, total)) => {
            let _ = writeln!(out, "RAM                      : {} MB used / {} MB total", used, total);
        }
        None => out.push_str("RAM                      : unavailable\n"),
    }
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    let _ = write!(out, "CPU cores                : {}", cores);
    out
}

/// Used and total memory in MB, read from `/proc/meminfo` where present.
fn memory_usage_mb() -> Option<(u64, u64)> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total_kb = field("MemTotal:")?;
    let free_kb = field("MemFree:")?;
    Some((total_kb.saturating_sub(free_kb) / 1024, total_kb / 1024))
}

/// Persisted readings, oldest first.
pub fn render_readings(rows: &[Reading]) -> String {
    let mut out = format!("{:<20} {:<15} {:<10}\n", "Timestamp", "Sensor ID", "Temperature");
    out.push_str("-------------------------------------------------------------");
    for r in rows {
        let at = Utc
            .timestamp_opt(r.timestamp, 0)
            .single()
            .map(|t| local_time(&t))
            .unwrap_or_else(|| r.timestamp.to_string());
        let _ = write!(
            out,
            "\n{:<20} {:<15} {:<10.2}",
            at,
            r.sensor_id.to_string(),
            r.temperature
        );
    }
    out
}

pub fn read_log(path: &Path) -> io::Result<String> {
    let content = fs::read_to_string(path)?;
    Ok(format!(
        "=== Log File ({}) ===\n{}=== End of Log ===",
        path.display(),
        content
    ))
}

/// Truncates the log file, leaving a marker line.
pub fn clear_log(path: &Path) -> io::Result<()> {
    fs::write(
        path,
        format!("=== Log file cleared at {} ===\n", Utc::now().timestamp()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::plain_context;
    use crate::session::{link, Session};
    use tempfile::TempDir;

    #[test]
    fn test_parse_zero_arg_commands() {
        assert_eq!(Command::parse("status", 8080), Ok(Command::Status));
        assert_eq!(Command::parse("  STATS  ", 8080), Ok(Command::Stats));
        assert_eq!(Command::parse("ReadDB", 8080), Ok(Command::ReadDb));
        assert_eq!(Command::parse("clearlog", 8080), Ok(Command::ClearLog));
        assert_eq!(Command::parse("log", 8080), Ok(Command::Log));
        assert_eq!(Command::parse("exit", 8080), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("   ", 8080), Err(CommandError::Empty));
        assert_eq!(
            Command::parse("reboot now", 8080),
            Err(CommandError::Unknown("reboot now".to_string()))
        );

        let err = Command::parse("status extra", 8080).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Command 'status' expects 0 parameters, got 1"
        );
        assert_eq!(
            Command::parse("connect 10.0.0.1", 8080),
            Err(CommandError::WrongArity {
                name: "connect",
                expected: 2,
                got: 1
            })
        );
        assert_eq!(
            Command::parse("terminate abc", 8080),
            Err(CommandError::InvalidSensorId("abc".to_string()))
        );
    }

    #[test]
    fn test_parse_connect_validation() {
        assert_eq!(
            Command::parse("connect 10.0.0.7 9000", 8080),
            Ok(Command::Connect {
                ip: Ipv4Addr::new(10, 0, 0, 7),
                port: 9000
            })
        );
        for port in ["0", "65536", "-1", "http"] {
            assert_eq!(
                Command::parse(&format!("connect 10.0.0.7 {}", port), 8080),
                Err(CommandError::InvalidPort)
            );
        }
        // Port is checked first.
        assert_eq!(
            Command::parse("connect not-an-ip 0", 8080),
            Err(CommandError::InvalidPort)
        );
        assert_eq!(
            Command::parse("connect ::1 9000", 8080),
            Err(CommandError::InvalidIp)
        );
        assert_eq!(
            Command::parse("connect 10.0.0.7 8080", 8080),
            Err(CommandError::PortAlreadyRunning(8080))
        );
    }

    #[test]
    fn test_parse_terminate() {
        assert_eq!(
            Command::parse("TERMINATE 4", 8080),
            Ok(Command::Terminate(SensorId(4)))
        );
    }

    #[test]
    fn test_render_stats_rows() {
        let (handle, _watch) = link();
        let mut session = Session::new("192.168.1.20", "192.168.1.20", 9000, false, handle);
        session.sensor_id = SensorId(3);
        let out = render_stats(1, &[session.info()]);

        assert!(out.starts_with("=== ACTIVE CONNECTIONS (1) ==="));
        let row = out.lines().nth(4).unwrap();
        assert!(row.starts_with("|    3 |      192.168.1.20 |  9000 |  CONNECTED |"));
        assert!(out.ends_with(STATS_RULE));
    }

    #[test]
    fn test_render_readings() {
        let out = render_readings(&[Reading::at(0, SensorId(1), 21.5)]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Timestamp"));
        assert!(lines[2].contains("21.50"));
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       8192000 kB\nMemFree:        2048000 kB\nMemAvailable:   4096000 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some((6000, 8000)));
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn test_log_read_and_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.log");
        fs::write(&path, "line one\nline two\n").unwrap();

        let out = read_log(&path).unwrap();
        assert!(out.contains("line two"));
        assert!(out.ends_with("=== End of Log ==="));

        clear_log(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("=== Log file cleared at"));
        assert!(!content.contains("line one"));

        assert!(read_log(&dir.path().join("missing.log")).is_err());
    }

    #[tokio::test]
    async fn test_execute_terminate_and_stats() {
        let dir = TempDir::new().unwrap();
        let ctx = plain_context(dir.path(), |_| {});
        let (handle, mut watch) = link();
        let id = ctx
            .table
            .insert(Session::new("10.0.0.1", "10.0.0.1", 9000, false, handle))
            .unwrap();

        let stats = execute(&ctx, Command::Stats).await.unwrap().unwrap();
        assert!(stats.contains("(1)"));

        let out = execute(&ctx, Command::Terminate(id)).await.unwrap().unwrap();
        assert_eq!(out, format!("Sensor {} terminated", id));
        watch.closed().await;
        assert_eq!(ctx.table.active_count(), 0);

        let out = execute(&ctx, Command::Terminate(id)).await.unwrap().unwrap();
        assert_eq!(out, format!("Sensor {} not found", id));

        assert!(execute(&ctx, Command::Quit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execute_readdb_and_status() {
        let dir = TempDir::new().unwrap();
        let ctx = plain_context(dir.path(), |_| {});

        let out = execute(&ctx, Command::ReadDb).await.unwrap().unwrap();
        assert_eq!(out, "Database not connected.");

        ctx.storage.try_connect().unwrap();
        ctx.storage.enqueue(Reading::at(10, SensorId(0), 30.0));
        ctx.storage.drain().unwrap();
        let out = execute(&ctx, Command::ReadDb).await.unwrap().unwrap();
        assert!(out.contains("30.00"));

        let status = execute(&ctx, Command::Status).await.unwrap().unwrap();
        assert!(status.contains("Total messages received  : 1 (live buffer: 0)"));
        assert!(status.contains("CPU cores"));
    }

    #[tokio::test]
    async fn test_execute_log_commands_follow_config() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("gateway.log");
        fs::write(&log_path, "hello\n").unwrap();
        let ctx = plain_context(dir.path(), |c| c.logging.file = Some(log_path.clone()));

        let out = execute(&ctx, Command::Log).await.unwrap().unwrap();
        assert!(out.contains("hello"));
        execute(&ctx, Command::ClearLog).await.unwrap();
        assert!(!fs::read_to_string(&log_path).unwrap().contains("hello"));
    }
}

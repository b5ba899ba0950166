use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::Value;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start_scanning(&self) -> zbus::Result<()>;
    fn stop_scanning(&self) -> zbus::Result<()>;
    fn enroll(&self, employee_id: &str, name: &str, image_paths: Vec<String>) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn list_employees(&self) -> zbus::Result<String>;
    fn remove_employee(&self, employee_id: &str) -> zbus::Result<bool>;
    fn recent_sessions(&self, limit: u32) -> zbus::Result<String>;

    #[zbus(signal)]
    fn scan_event(&self, payload: String) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start periodic scanning
    Start,
    /// Stop scanning
    Stop,
    /// Show daemon status
    Status,
    /// Follow recognition decisions as they happen
    Watch {
        /// Print every cycle, not just decisions
        #[arg(short, long)]
        verbose: bool,
    },
    /// Enroll an employee from face images, or from the camera if none given
    Enroll {
        employee_id: String,
        name: String,
        images: Vec<PathBuf>,
    },
    /// List enrolled employees
    List,
    /// Remove an enrolled employee
    Remove { employee_id: String },
    /// Show recent attendance sessions
    Sessions {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Start => {
            proxy.start_scanning().await?;
            println!("Scanning started");
        }
        Commands::Stop => {
            proxy.stop_scanning().await?;
            println!("Scanning stopped");
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Watch { verbose } => {
            let mut stream = proxy.receive_scan_event().await?;
            println!("Watching scan events (Ctrl-C to quit)");
            while let Some(signal) = stream.next().await {
                let args = signal.args()?;
                let event: Value = match serde_json::from_str(&args.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed scan event");
                        continue;
                    }
                };
                if let Some(line) = describe_event(&event, verbose) {
                    println!("{line}");
                }
            }
        }
        Commands::Enroll {
            employee_id,
            name,
            images,
        } => {
            // The daemon resolves paths from its own working directory.
            let paths = images
                .iter()
                .map(|p| {
                    std::fs::canonicalize(p)
                        .with_context(|| format!("cannot read {}", p.display()))
                        .map(|p| p.to_string_lossy().into_owned())
                })
                .collect::<Result<Vec<_>>>()?;
            if paths.is_empty() {
                println!("Capturing {employee_id} from the camera, hold still...");
            }
            let result: Value = serde_json::from_str(&proxy.enroll(&employee_id, &name, paths).await?)?;
            println!(
                "Enrolled {} ({})",
                result["employee_id"].as_str().unwrap_or(&employee_id),
                result["name"].as_str().unwrap_or(&name)
            );
        }
        Commands::List => {
            let employees: Vec<Value> = serde_json::from_str(&proxy.list_employees().await?)?;
            if employees.is_empty() {
                println!("No employees enrolled");
            }
            for e in &employees {
                println!(
                    "{:<16} {:<32} {} template(s)",
                    text(&e["employee_id"]),
                    text(&e["name"]),
                    e["templates"]
                );
            }
        }
        Commands::Remove { employee_id } => {
            if proxy.remove_employee(&employee_id).await? {
                println!("Removed {employee_id}");
            } else {
                println!("{employee_id} was not enrolled");
            }
        }
        Commands::Sessions { limit } => {
            let sessions: Vec<Value> = serde_json::from_str(&proxy.recent_sessions(limit).await?)?;
            if sessions.is_empty() {
                println!("No attendance recorded");
            }
            for s in &sessions {
                println!("{}", describe_session(s));
            }
        }
    }

    Ok(())
}

fn text(v: &Value) -> &str {
    v.as_str().unwrap_or("-")
}

fn describe_session(s: &Value) -> String {
    let check_out = match s["check_out"].as_str() {
        Some(t) => format!("out {t} ({}s)", s["duration_secs"]),
        None => "open".to_string(),
    };
    format!(
        "{:<16} {:<24} in {}  {}",
        text(&s["employee_id"]),
        text(&s["name"]),
        text(&s["check_in"]),
        check_out
    )
}

/// One line per interesting cycle; quiet cycles only in verbose mode.
fn describe_event(event: &Value, verbose: bool) -> Option<String> {
    let at = text(&event["at"]);
    if let Some(stopped) = event.get("stopped") {
        return Some(match stopped["reason"].as_str() {
            Some("timed_out") => format!("{at}  scanning stopped after {}s timeout", stopped["after_secs"]),
            _ => format!("{at}  scanning stopped"),
        });
    }
    if let Some(attendance) = event.get("attendance").filter(|a| !a.is_null()) {
        let line = match attendance["result"].as_str() {
            Some("check_in") => format!("checked in  {}", text(&attendance["session"]["employee_id"])),
            Some("check_out") => format!(
                "checked out {} after {}s",
                text(&attendance["session"]["employee_id"]),
                attendance["session"]["duration_secs"]
            ),
            Some("ignored") => format!("ignored (re-scan after {}s)", attendance["elapsed_secs"]),
            _ => format!("attendance error: {}", text(&attendance["message"])),
        };
        return Some(format!("{at}  {line}"));
    }
    match event["decision"]["decision"].as_str() {
        Some("confirmed") => Some(format!(
            "{at}  confirmed {}",
            text(&event["decision"]["employee_id"])
        )),
        Some("unknown") => Some(format!("{at}  unknown face")),
        _ if verbose => Some(format!(
            "{at}  {} face(s), vote {}",
            event["faces"].as_array().map_or(0, Vec::len),
            event["vote"]
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe_check_in() {
        let event = json!({
            "at": "2026-01-05T09:00:00Z",
            "faces": [{}],
            "decision": {"decision": "confirmed", "employee_id": "E1"},
            "attendance": {"result": "check_in", "session": {"employee_id": "E1"}}
        });
        assert_eq!(
            describe_event(&event, false).as_deref(),
            Some("2026-01-05T09:00:00Z  checked in  E1")
        );
    }

    #[test]
    fn test_pending_cycle_quiet_unless_verbose() {
        let event = json!({
            "at": "t",
            "faces": [],
            "vote": null,
            "decision": {"decision": "pending"},
            "attendance": null
        });
        assert_eq!(describe_event(&event, false), None);
        assert_eq!(describe_event(&event, true).as_deref(), Some("t  0 face(s), vote null"));
    }

    #[test]
    fn test_describe_timeout_stop() {
        let event = json!({
            "at": "t",
            "faces": [],
            "vote": null,
            "decision": {"decision": "pending"},
            "attendance": null,
            "stopped": {"reason": "timed_out", "after_secs": 600}
        });
        assert_eq!(
            describe_event(&event, false).as_deref(),
            Some("t  scanning stopped after 600s timeout")
        );
    }

    #[test]
    fn test_describe_unknown() {
        let event = json!({"at": "t", "decision": {"decision": "unknown"}, "attendance": null});
        assert_eq!(describe_event(&event, false).as_deref(), Some("t  unknown face"));
    }

    #[test]
    fn test_describe_open_session() {
        let s = json!({"employee_id": "E1", "name": "Ada", "check_in": "t0", "check_out": null, "duration_secs": 0});
        assert!(describe_session(&s).ends_with("open"));
    }
}

//! Thin `reqwest` client over the HTTP API, exit codes matching operator
//! expectations: `0` success, `1` generic failure, `2` invariant violation,
//! `3` quality gate blocked.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Operator CLI for the fleet-core orchestrator")]
struct Cli {
    /// Base URL of the running API server.
    #[arg(long, env = "FLEET_API_URL", default_value = "http://127.0.0.1:7870")]
    base_url: String,

    /// Bearer token, if the server requires one.
    #[arg(long, env = "FLEET_API_KEY")]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tasks.
    Task {
        #[command(subcommand)]
        cmd: TaskCmd,
    },
    /// Manage agents.
    Agent {
        #[command(subcommand)]
        cmd: AgentCmd,
    },
    /// Print queue, registry and event bus status.
    Status,
    /// Run an artifact through the quality gate.
    Gate {
        #[command(subcommand)]
        cmd: GateCmd,
    },
    /// Integrate a pull request through the gate.
    Pr {
        #[command(subcommand)]
        cmd: PrCmd,
    },
    /// Tail recent events.
    Events {
        #[command(subcommand)]
        cmd: EventsCmd,
    },
    /// Generate a new API key for `FLEET_API_KEY`. Does not call the server.
    Keygen,
}

#[derive(Subcommand)]
enum TaskCmd {
    Add {
        id: String,
        task_type: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long, value_delimiter = ',')]
        dependencies: Vec<String>,
        /// Deadline as seconds from now.
        #[arg(long)]
        deadline_secs: Option<i64>,
        #[arg(long)]
        timeout_seconds: Option<i64>,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Risk-context flag for the confidence tracker, `key=value`. Repeatable.
        /// Recognized keys: complexity, has_security_implications,
        /// has_architecture_changes, affects_performance, is_customer_facing,
        /// modifies_critical_path, external_confidence.
        #[arg(long = "data", value_parser = parse_key_val)]
        data: Vec<(String, String)>,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Cancel {
        id: String,
    },
}

#[derive(Subcommand)]
enum AgentCmd {
    Register {
        id: String,
        base_url: String,
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },
    List,
    Heartbeat {
        id: String,
    },
    Sleep {
        id: String,
        /// Path to a file holding the memory snapshot to carry into sleep.
        #[arg(long)]
        payload_file: Option<String>,
    },
    Wake {
        id: String,
    },
}

#[derive(Subcommand)]
enum GateCmd {
    /// Evaluate an artifact described by a JSON file (`-` for stdin).
    Check { file: String },
}

#[derive(Subcommand)]
enum PrCmd {
    Integrate {
        id: String,
        #[arg(long)]
        batch: bool,
    },
}

#[derive(Subcommand)]
enum EventsCmd {
    Tail {
        #[arg(long)]
        event_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[derive(Serialize)]
struct CreateTaskRequest {
    id: String,
    task_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    priority: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    data: std::collections::HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deadline: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
}

/// Parses a `key=value` CLI argument into a pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    Ok((key.to_string(), value.to_string()))
}

#[derive(Serialize)]
struct RegisterAgentRequest {
    id: String,
    base_url: String,
    capabilities: Vec<String>,
}

#[derive(Serialize, Default)]
struct SleepRequest {
    payload: Vec<u8>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

struct Client {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Client {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, CliError> {
        let response = builder.send().await.map_err(|e| CliError::generic(e.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }
        let message = serde_json::from_value::<ErrorBody>(body.clone())
            .map(|e| e.error)
            .unwrap_or_else(|_| status.to_string());
        Err(CliError::from_status(status, message))
    }
}

enum CliError {
    Generic(String),
    InvariantViolation(String),
    GateBlocked(String),
}

impl CliError {
    fn generic(message: String) -> Self {
        CliError::Generic(message)
    }

    fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status {
            reqwest::StatusCode::UNPROCESSABLE_ENTITY => CliError::GateBlocked(message),
            reqwest::StatusCode::BAD_REQUEST => CliError::InvariantViolation(message),
            _ => CliError::Generic(message),
        }
    }

    fn exit_code(&self) -> u8 {
        match self {
            CliError::Generic(_) => 1,
            CliError::InvariantViolation(_) => 2,
            CliError::GateBlocked(_) => 3,
        }
    }

    fn message(&self) -> &str {
        match self {
            CliError::Generic(m) | CliError::InvariantViolation(m) | CliError::GateBlocked(m) => m,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = Client {
        http: reqwest::Client::new(),
        base_url: cli.base_url.trim_end_matches('/').to_string(),
        api_key: cli.api_key,
    };

    match run(&client, cli.command).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("error: {}", e.message());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(client: &Client, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Task { cmd } => run_task(client, cmd).await,
        Commands::Agent { cmd } => run_agent(client, cmd).await,
        Commands::Status => {
            let body = client.send(client.request(reqwest::Method::GET, "/status")).await?;
            print_json(&body);
            Ok(())
        }
        Commands::Gate { cmd } => run_gate(client, cmd).await,
        Commands::Pr { cmd } => run_pr(client, cmd).await,
        Commands::Events { cmd } => run_events(client, cmd).await,
        Commands::Keygen => {
            println!("{}", fleet_core::auth::generate_api_key());
            Ok(())
        }
    }
}

async fn run_task(client: &Client, cmd: TaskCmd) -> Result<(), CliError> {
    match cmd {
        TaskCmd::Add {
            id,
            task_type,
            description,
            priority,
            dependencies,
            deadline_secs,
            timeout_seconds,
            max_attempts,
            data,
        } => {
            let deadline = deadline_secs.map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs));
            let req = CreateTaskRequest {
                id,
                task_type,
                description,
                priority,
                dependencies,
                data: data.into_iter().collect(),
                deadline,
                timeout_seconds,
                max_attempts,
            };
            let body = client
                .send(client.request(reqwest::Method::POST, "/tasks").json(&req))
                .await?;
            print_json(&body);
        }
        TaskCmd::List { status } => {
            let path = match status {
                Some(s) => format!("/tasks?status={s}"),
                None => "/tasks".to_string(),
            };
            let body = client.send(client.request(reqwest::Method::GET, &path)).await?;
            print_json(&body);
        }
        TaskCmd::Cancel { id } => {
            let body = client
                .send(client.request(reqwest::Method::DELETE, &format!("/tasks/{id}")))
                .await?;
            print_json(&body);
        }
    }
    Ok(())
}

async fn run_agent(client: &Client, cmd: AgentCmd) -> Result<(), CliError> {
    match cmd {
        AgentCmd::Register {
            id,
            base_url,
            capabilities,
        } => {
            let req = RegisterAgentRequest {
                id,
                base_url,
                capabilities,
            };
            let body = client
                .send(client.request(reqwest::Method::POST, "/agents").json(&req))
                .await?;
            print_json(&body);
        }
        AgentCmd::List => {
            let body = client.send(client.request(reqwest::Method::GET, "/agents")).await?;
            print_json(&body);
        }
        AgentCmd::Heartbeat { id } => {
            let body = client
                .send(
                    client
                        .request(reqwest::Method::POST, &format!("/agents/{id}/heartbeat"))
                        .json(&serde_json::json!({})),
                )
                .await?;
            print_json(&body);
        }
        AgentCmd::Sleep { id, payload_file } => {
            let payload = match payload_file {
                Some(path) => std::fs::read(&path).map_err(|e| CliError::generic(e.to_string()))?,
                None => Vec::new(),
            };
            let req = SleepRequest { payload };
            let body = client
                .send(
                    client
                        .request(reqwest::Method::POST, &format!("/agents/{id}/sleep"))
                        .json(&req),
                )
                .await?;
            print_json(&body);
        }
        AgentCmd::Wake { id } => {
            let body = client
                .send(client.request(reqwest::Method::POST, &format!("/agents/{id}/wake")))
                .await?;
            print_json(&body);
        }
    }
    Ok(())
}

async fn run_gate(client: &Client, cmd: GateCmd) -> Result<(), CliError> {
    match cmd {
        GateCmd::Check { file } => {
            let raw = if file == "-" {
                use std::io::Read;
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .map_err(|e| CliError::generic(e.to_string()))?;
                buf
            } else {
                std::fs::read_to_string(&file).map_err(|e| CliError::generic(e.to_string()))?
            };
            let artifact: Value =
                serde_json::from_str(&raw).map_err(|e| CliError::generic(e.to_string()))?;
            let body = client
                .send(client.request(reqwest::Method::POST, "/gate/check").json(&artifact))
                .await?;
            print_json(&body);
            if body.get("decision").and_then(Value::as_str) == Some("Block") {
                return Err(CliError::GateBlocked("quality gate blocked".to_string()));
            }
        }
    }
    Ok(())
}

async fn run_pr(client: &Client, cmd: PrCmd) -> Result<(), CliError> {
    match cmd {
        PrCmd::Integrate { id, batch } => {
            let path = if batch {
                format!("/pr/{id}/integrate?batch=true")
            } else {
                format!("/pr/{id}/integrate")
            };
            let body = client.send(client.request(reqwest::Method::POST, &path)).await?;
            print_json(&body);
        }
    }
    Ok(())
}

async fn run_events(client: &Client, cmd: EventsCmd) -> Result<(), CliError> {
    match cmd {
        EventsCmd::Tail { event_type, limit } => {
            let mut path = format!("/events/tail?limit={limit}");
            if let Some(t) = event_type {
                path.push_str(&format!("&event_type={t}"));
            }
            let body = client.send(client.request(reqwest::Method::GET, &path)).await?;
            print_json(&body);
        }
    }
    Ok(())
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clap_parses_task_add() {
        let cli = Cli::try_parse_from(["fleetctl", "task", "add", "t1", "refactor"])
            .expect("parse task add");
        assert!(matches!(cli.command, Commands::Task { .. }));
    }

    #[test]
    fn clap_requires_task_subcommand_args() {
        assert!(Cli::try_parse_from(["fleetctl", "task", "add"]).is_err());
    }

    #[test]
    fn exit_codes_match_error_kind() {
        assert_eq!(CliError::Generic("x".into()).exit_code(), 1);
        assert_eq!(CliError::InvariantViolation("x".into()).exit_code(), 2);
        assert_eq!(CliError::GateBlocked("x".into()).exit_code(), 3);
    }
}

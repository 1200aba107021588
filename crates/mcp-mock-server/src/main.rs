//! mcp-mock-server: minimal MCP server over stdio
//!
//! Serves a fixed set of tools, one prompt and one resource so that the
//! manager can be exercised against a real subprocess.
//!
//! Tools: `echo {text}`, `add {a, b}`, `slow {ms, text}`, `crash` (exits the
//! process without replying) and `big` (a long text result).

use anyhow::{bail, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use mcp_hub::protocol::MCP_PROTOCOL_VERSION;
use mcp_hub::transport::{FrameCodec, Framing};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

const TOOLS: [(&str, &str); 5] = [
    ("echo", "Return the given text"),
    ("add", "Add two numbers"),
    ("slow", "Sleep for `ms` milliseconds, then echo"),
    ("crash", "Terminate the server"),
    ("big", "Return a long text"),
];

/// Tools per `tools/list` page
const PAGE_SIZE: usize = 2;

#[derive(Debug, Parser)]
#[command(name = "mcp-mock-server")]
#[command(about = "Minimal MCP server for tests", version)]
struct Cli {
    /// Message framing on stdout/stdin
    #[arg(long, default_value = "content-length", value_parser = ["ndjson", "content-length"])]
    framing: String,

    /// Emit non-protocol output and server-initiated messages
    #[arg(long)]
    noisy: bool,
}

fn text_result(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

fn reply(id: Value, outcome: Result<Value, (i64, String)>) -> Value {
    match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message }
        }),
    }
}

fn list_tools(params: &Value) -> Value {
    let start = params["cursor"]
        .as_str()
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0)
        .min(TOOLS.len());
    let end = (start + PAGE_SIZE).min(TOOLS.len());

    let tools: Vec<Value> = TOOLS[start..end]
        .iter()
        .map(|(name, description)| {
            json!({
                "name": name,
                "description": description,
                "inputSchema": { "type": "object" }
            })
        })
        .collect();

    let mut result = json!({ "tools": tools });
    if end < TOOLS.len() {
        result["nextCursor"] = json!(end.to_string());
    }
    result
}

async fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let args = &params["arguments"];
    let text = args["text"].as_str().unwrap_or_default();

    match params["name"].as_str().unwrap_or_default() {
        "echo" => Ok(text_result(text)),
        "add" => {
            let a = args["a"].as_f64().ok_or((-32602, "missing 'a'".to_string()))?;
            let b = args["b"].as_f64().ok_or((-32602, "missing 'b'".to_string()))?;
            Ok(text_result((a + b).to_string()))
        }
        "slow" => {
            let ms = args["ms"].as_u64().unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_result(text))
        }
        "crash" => std::process::exit(3),
        "big" => Ok(text_result("word ".repeat(200))),
        other => Err((-32602, format!("Unknown tool: {}", other))),
    }
}

async fn handle(method: &str, params: Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": {}, "prompts": {}, "resources": {} },
            "serverInfo": { "name": "mcp-mock-server", "version": env!("CARGO_PKG_VERSION") }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(list_tools(&params)),
        "tools/call" => call_tool(&params).await,
        "prompts/list" => Ok(json!({ "prompts": [{
            "name": "greet",
            "description": "Greet someone",
            "arguments": [{ "name": "who", "required": true }]
        }]})),
        "prompts/get" => {
            let who = params["arguments"]["who"].as_str().unwrap_or("nobody");
            Ok(json!({ "messages": [{
                "role": "user",
                "content": { "type": "text", "text": format!("Hello, {}!", who) }
            }]}))
        }
        "resources/list" => Ok(json!({ "resources": [{
            "uri": "mock://readme",
            "name": "readme",
            "mimeType": "text/plain"
        }]})),
        "resources/read" => match params["uri"].as_str() {
            Some("mock://readme") => Ok(json!({ "contents": [{
                "uri": "mock://readme",
                "mimeType": "text/plain",
                "text": "mock readme"
            }]})),
            _ => Err((-32002, "Resource not found".to_string())),
        },
        other => Err((-32601, format!("Method not found: {}", other))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let framing = match cli.framing.as_str() {
        "ndjson" => Framing::Ndjson,
        "content-length" => Framing::ContentLength,
        other => bail!("Unknown framing: {}", other),
    };

    let mut reader = FramedRead::new(tokio::io::stdin(), FrameCodec::new(framing));
    let mut writer = FramedWrite::new(tokio::io::stdout(), FrameCodec::new(framing));

    if cli.noisy {
        writer
            .get_mut()
            .write_all(b"mock server starting up\nWARN: cache cold\n\n")
            .await?;
        eprintln!("mock server: diagnostics go to stderr");
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            writer.send(message).await?;
        }
        anyhow::Ok(())
    });

    while let Some(frame) = reader.next().await {
        let message = frame?;
        let Some(method) = message["method"].as_str().map(str::to_string) else {
            // Replies to our own requests
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let Some(id) = message.get("id").cloned() else {
            if method == "notifications/initialized" && cli.noisy {
                let _ = tx.send(json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": { "level": "info", "data": "mock server ready" }
                }));
                let _ = tx.send(json!({ "jsonrpc": "2.0", "id": "srv-1", "method": "roots/list" }));
            }
            continue;
        };

        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = handle(&method, params).await;
            let _ = tx.send(reply(id, outcome));
        });
    }

    drop(tx);
    writer_task.await??;
    Ok(())
}

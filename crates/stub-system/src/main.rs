//! A minimal MCP tool server over stdio, used to exercise the client end to end.
//!
//! Speaks newline-delimited JSON-RPC 2.0 on stdin/stdout and exits when stdin closes.
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

const PROTOCOL_VERSION: &str = "2024-11-05";
const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn tools() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the given message unchanged",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }
        },
        {
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }
        }
    ])
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": is_error})
}

fn call_tool(params: &Value) -> Value {
    let arguments = &params["arguments"];
    match params["name"].as_str() {
        Some("echo") => match arguments["message"].as_str() {
            Some(message) => text_result(message.to_string(), false),
            None => text_result("echo requires a string `message`".to_string(), true),
        },
        Some("add") => match (arguments["a"].as_f64(), arguments["b"].as_f64()) {
            (Some(a), Some(b)) => text_result((a + b).to_string(), false),
            _ => text_result("add requires numbers `a` and `b`".to_string(), true),
        },
        Some(other) => text_result(format!("Unknown tool: {}", other), true),
        None => text_result("Missing tool name".to_string(), true),
    }
}

fn handle(request: &Request) -> Result<Value, (i64, String)> {
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "stub-mcp", "version": env!("CARGO_PKG_VERSION")},
            "instructions": "Use add for arithmetic and echo to repeat text."
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({"tools": tools()})),
        "tools/call" if request.params.is_object() => Ok(call_tool(&request.params)),
        "tools/call" => Err((INVALID_PARAMS, "tools/call requires params".to_string())),
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {}", other))),
    }
}

fn respond(line: &str) -> Option<Value> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": PARSE_ERROR, "message": e.to_string()}
            }))
        }
    };

    // Notifications get no response
    let id = request.id.clone()?;
    Some(match handle(&request) {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }),
    })
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = respond(&line) {
            let mut out = response.to_string();
            out.push('\n');
            stdout.write_all(out.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

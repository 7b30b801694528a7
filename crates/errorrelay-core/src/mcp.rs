//! Minimal MCP server over stdio exposing the query interface as a tool.
//!
//! Messages are newline-delimited JSON-RPC 2.0:
//! - `initialize` establishes capabilities
//! - `tools/list` advertises `get_browser_logs`
//! - `tools/call` runs it; failures come back as `isError: true` results
//!
//! stdout carries only protocol messages; diagnostics go to stderr via
//! `tracing`.

use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::query::{GET_BROWSER_LOGS, QueryInterface};

/// Protocol revision reported in the `initialize` response.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name reported in the `initialize` response.
pub const SERVER_NAME: &str = "errorrelay";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;

fn jsonrpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn jsonrpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn tool_result(text: &str, is_error: bool) -> Value {
    let mut result = json!({ "content": [{ "type": "text", "text": text }] });
    if is_error {
        result["isError"] = Value::Bool(true);
    }
    result
}

fn tool_descriptor(name: &str) -> Value {
    let description = match name {
        GET_BROWSER_LOGS => {
            "Return the most recent runtime errors (uncaught exceptions, unhandled \
             promise rejections, crashes) reported by the instrumented app, oldest first."
        }
        _ => "",
    };
    json!({
        "name": name,
        "description": description,
        "inputSchema": { "type": "object", "properties": {}, "required": [] },
    })
}

fn tool_list() -> Value {
    let tools: Vec<Value> = QueryInterface::operations()
        .iter()
        .map(|name| tool_descriptor(name))
        .collect();
    json!({ "tools": tools })
}

/// Stateless request handler around a [`QueryInterface`].
#[derive(Debug, Clone)]
pub struct McpServer {
    query: QueryInterface,
}

impl McpServer {
    #[must_use]
    pub fn new(query: QueryInterface) -> Self {
        Self { query }
    }

    /// Handle one line of input. Notifications produce no response.
    #[must_use]
    pub fn handle_line(&self, line: &str) -> Option<Value> {
        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Unparseable MCP message");
                return Some(jsonrpc_error(&Value::Null, PARSE_ERROR, "Parse error"));
            }
        };
        self.handle_message(&message)
    }

    /// Handle one decoded JSON-RPC message.
    #[must_use]
    pub fn handle_message(&self, message: &Value) -> Option<Value> {
        let id = message.get("id").cloned();
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return id.map(|id| jsonrpc_error(&id, INVALID_REQUEST, "Invalid request"));
        };

        let Some(id) = id else {
            if method == "notifications/initialized" {
                info!("MCP client initialized");
            } else {
                debug!(method, "Ignoring MCP notification");
            }
            return None;
        };

        let response = match method {
            "initialize" => jsonrpc_result(
                &id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": SERVER_NAME, "version": crate::VERSION },
                }),
            ),
            "ping" => jsonrpc_result(&id, json!({})),
            "tools/list" => jsonrpc_result(&id, tool_list()),
            "tools/call" => {
                let name = message
                    .get("params")
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let response = self.query.call(name);
                if response.is_error {
                    warn!(tool = name, "Unknown tool requested");
                }
                jsonrpc_result(&id, tool_result(&response.text, response.is_error))
            }
            other => jsonrpc_error(&id, METHOD_NOT_FOUND, &format!("Method not found: {other}")),
        };
        Some(response)
    }

    /// Serve until `reader` reaches EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(line) {
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                writer.write_all(&out).await?;
                writer.flush().await?;
            }
        }
        info!("MCP input closed");
        Ok(())
    }

    /// Serve on the process's stdin/stdout.
    pub async fn serve_stdio(&self) -> std::io::Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryBuffer;
    use crate::record::{ErrorKind, ErrorRecord};
    use crate::query::EMPTY_HISTORY_GUIDANCE;
    use std::sync::Arc;

    fn server() -> (McpServer, Arc<HistoryBuffer>) {
        let history = Arc::new(HistoryBuffer::new());
        (
            McpServer::new(QueryInterface::new(Arc::clone(&history))),
            history,
        )
    }

    #[test]
    fn initialize_reports_server_info() {
        let (server, _) = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .unwrap();
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], SERVER_NAME);
        assert!(resp["result"]["capabilities"]["tools"].is_object());
    }

    #[test]
    fn initialized_notification_has_no_response() {
        let (server, _) = server();
        assert!(
            server
                .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .is_none()
        );
    }

    #[test]
    fn tools_list_has_single_tool() {
        let (server, _) = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#)
            .unwrap();
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], GET_BROWSER_LOGS);
        assert_eq!(tools[0]["inputSchema"]["type"], "object");
        assert!(
            tools[0]["description"]
                .as_str()
                .is_some_and(|d| d.contains("oldest first"))
        );
    }

    #[test]
    fn every_listed_tool_is_callable() {
        let (server, _) = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":"l","method":"tools/list"}"#)
            .unwrap();
        let names: Vec<&str> = resp["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, QueryInterface::operations());

        for name in names {
            let call = json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "tools/call",
                "params": { "name": name },
            });
            let resp = server.handle_line(&call.to_string()).unwrap();
            assert!(resp["result"].get("isError").is_none(), "{name} failed");
        }
    }

    #[test]
    fn tools_call_returns_logs() {
        let (server, history) = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"get_browser_logs","arguments":{}}}"#)
            .unwrap();
        assert_eq!(resp["result"]["content"][0]["text"], EMPTY_HISTORY_GUIDANCE);
        assert!(resp["result"].get("isError").is_none());

        history.record(ErrorRecord::new(ErrorKind::Crash, "renderer died", 99));
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"get_browser_logs"}}"#)
            .unwrap();
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("CRASH: renderer died"));
    }

    #[test]
    fn unknown_tool_is_error_result() {
        let (server, _) = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"rm_rf"}}"#)
            .unwrap();
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(
            resp["result"]["content"][0]["text"],
            "Unknown operation: rm_rf"
        );
    }

    #[test]
    fn unknown_method_and_bad_json() {
        let (server, _) = server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":5,"method":"resources/list"}"#)
            .unwrap();
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);

        let resp = server.handle_line("{nope").unwrap();
        assert_eq!(resp["error"]["code"], PARSE_ERROR);
        assert!(resp["id"].is_null());

        let resp = server.handle_line(r#"{"jsonrpc":"2.0","id":6}"#).unwrap();
        assert_eq!(resp["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn serve_writes_one_line_per_request() {
        let (server, _) = server();
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            "\n",
        );
        let mut output = Vec::new();
        server
            .serve(tokio::io::BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["id"], 2);
    }
}

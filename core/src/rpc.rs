//! RpcFront: a single local socket endpoint dispatching by operation name
//! (spec §4.6). Wire format is newline-delimited JSON over TCP — plain
//! blocking I/O, no async runtime, matching the teacher's synchronous
//! style. Callers that fail to connect fall through to in-process mode.

use crate::query::{QueryEngine, QueryFilters, SimilarityMatch};
use crate::{Core, Hash, ImgcatError, Record, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    op: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<String>,
}

impl Response {
    fn ok(value: Value) -> Self {
        Self {
            ok: Some(value),
            error: None,
            trace: None,
        }
    }

    fn err(e: ImgcatError) -> Self {
        Self {
            ok: None,
            error: Some(e.to_string()),
            trace: Some(format!("{e:?}")),
        }
    }
}

/// Dispatches one named operation against `core`, logging the call at
/// debug (spec §4.6).
fn dispatch(core: &Core, req: &Request) -> Response {
    tracing::debug!(op = %req.op, args = %req.args, "rpc call");
    match handle(core, &req.op, &req.args) {
        Ok(value) => Response::ok(value),
        Err(e) => Response::err(e),
    }
}

fn handle(core: &Core, op: &str, args: &Value) -> Result<Value> {
    let engine = QueryEngine::new(&core.catalog, &core.trie);
    match op {
        "ping" => Ok(json!("pong")),

        "get" => {
            let uid = arg_uuid(args, "uid")?;
            let record = core.catalog.get(&uid)?;
            Ok(json!(record))
        }

        "insert" => {
            let mut record: Record = arg(args, "record")?;
            record.regenerate_keywords();
            core.catalog.insert(&record)?;
            let guard = core.trie.lock();
            if let Err(ImgcatError::DuplicateHash { message }) = guard.borrow_mut().add(&record.hash) {
                tracing::warn!(hash = %record.hash, %message, "possible duplicate hash on insert");
            }
            Ok(json!(null))
        }

        "update" => {
            let mut record: Record = arg(args, "record")?;
            record.regenerate_keywords();
            core.catalog.update(&record, time::OffsetDateTime::now_utc())?;
            Ok(json!(null))
        }

        "delete" => {
            let uid = arg_uuid(args, "uid")?;
            let record = core.catalog.get(&uid)?;
            core.catalog.delete(&uid)?;
            if let Some(record) = record {
                let guard = core.trie.lock();
                if core.catalog.count_with_hash(&record.hash)? == 0 {
                    guard.borrow_mut().remove(&record.hash)?;
                }
            }
            Ok(json!(null))
        }

        "query" => {
            let filters: QueryFilters = arg_query_filters(args)?;
            Ok(json!(engine.query(&filters)?))
        }

        "similar_by_hash" => {
            let hash: Hash = arg(args, "hash")?;
            let threshold = arg::<f64>(args, "threshold")?;
            let limit = arg::<usize>(args, "limit")?;
            let hits: Vec<SimilarityMatch> = engine.similar_by_hash(&hash, threshold, limit)?;
            Ok(json!(hits
                .into_iter()
                .map(|h| json!({"uid": h.uid, "similarity": h.similarity}))
                .collect::<Vec<_>>()))
        }

        "similar" => {
            let uid = arg_uuid(args, "uid")?;
            let threshold = arg::<f64>(args, "threshold")?;
            let limit = arg::<usize>(args, "limit")?;
            let hits: Vec<SimilarityMatch> = engine.similar(&uid, threshold, limit)?;
            Ok(json!(hits
                .into_iter()
                .map(|h| json!({"uid": h.uid, "similarity": h.similarity}))
                .collect::<Vec<_>>()))
        }

        "complete_uid_prefix" => {
            let prefix = arg::<String>(args, "prefix")?;
            Ok(json!(core.catalog.complete_uid_prefix(&prefix)?))
        }

        "tag_complete" => {
            let prefix = arg::<String>(args, "prefix")?;
            Ok(json!(core.catalog.tag_complete(&prefix)?))
        }

        "find_duplicates" => Ok(json!(core.catalog.find_duplicates()?)),

        _ => Err(ImgcatError::UnknownField {
            message: format!("no such operation '{op}'"),
        }),
    }
}

fn arg<T: serde::de::DeserializeOwned>(args: &Value, field: &str) -> Result<T> {
    let value = args.get(field).ok_or_else(|| ImgcatError::UnknownField {
        message: format!("missing argument '{field}'"),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| ImgcatError::ValidationError {
        message: format!("argument '{field}': {e}"),
    })
}

fn arg_uuid(args: &Value, field: &str) -> Result<Uuid> {
    let s: String = arg(args, field)?;
    Uuid::parse_str(&s).map_err(|e| ImgcatError::ValidationError {
        message: format!("argument '{field}' is not a uid: {e}"),
    })
}

fn arg_query_filters(args: &Value) -> Result<QueryFilters> {
    Ok(QueryFilters {
        author: args.get("author").and_then(|v| v.as_str()).map(str::to_string),
        caption: args.get("caption").and_then(|v| v.as_str()).map(str::to_string),
        source: args.get("source").and_then(|v| v.as_str()).map(str::to_string),
        rating: args.get("rating").and_then(|v| v.as_str()).map(str::to_string),
        keyword: args
            .get("keyword")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        not_keyword: args
            .get("not_keyword")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        limit: args.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize),
        random: args.get("random").and_then(|v| v.as_bool()).unwrap_or(false),
    })
}

/// Runs the RPC server loop on `127.0.0.1:port`, blocking forever. Exactly
/// one process should run this at a time — binding a second one fails with
/// "address in use", which is the spec's documented port-collision guard.
pub fn serve(core: Arc<Core>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).map_err(|e| ImgcatError::IoError {
        message: format!("binding rpc port {port}: {e}"),
    })?;
    tracing::info!(port, "rpc server listening");
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%e, "rpc accept failed");
                continue;
            }
        };
        let core = Arc::clone(&core);
        std::thread::spawn(move || {
            if let Err(e) = serve_connection(&core, stream) {
                tracing::warn!(%e, "rpc connection ended with error");
            }
        });
    }
    Ok(())
}

fn serve_connection(core: &Core, stream: TcpStream) -> Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => dispatch(core, &req),
            Err(e) => Response::err(ImgcatError::ValidationError {
                message: format!("malformed request: {e}"),
            }),
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes())?;
    }
    Ok(())
}

/// Either a live connection to a running `serve` instance, or a direct
/// handle on `core` used when no server is reachable (spec §4.6 in-process
/// fallback).
pub enum RpcFront {
    Remote { stream: TcpStream },
    InProcess { core: Arc<Core> },
}

impl RpcFront {
    /// Attempts to connect to `127.0.0.1:port`; falls through to
    /// in-process mode on any failure.
    pub fn connect_or_in_process(port: u16, core: Arc<Core>) -> Self {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => RpcFront::Remote { stream },
            Err(_) => RpcFront::InProcess { core },
        }
    }

    /// Calls one operation by name, returning its JSON result value.
    pub fn call(&mut self, op: &str, args: Value) -> Result<Value> {
        match self {
            RpcFront::InProcess { core } => handle(core, op, &args),
            RpcFront::Remote { stream } => {
                let request = Request {
                    op: op.to_string(),
                    args,
                };
                let mut line = serde_json::to_string(&request)?;
                line.push('\n');
                stream.write_all(line.as_bytes())?;

                let mut reader = BufReader::new(stream.try_clone()?);
                let mut response_line = String::new();
                reader.read_line(&mut response_line)?;
                let response: Response = serde_json::from_str(&response_line)?;
                match response.error {
                    Some(message) => Err(ImgcatError::InternalError { message }),
                    None => Ok(response.ok.unwrap_or(Value::Null)),
                }
            }
        }
    }

    /// The reachability probe (spec §4.6): `ping() -> "pong"`.
    pub fn ping(&mut self) -> Result<bool> {
        Ok(self.call("ping", json!({}))? == json!("pong"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_core() -> Arc<Core> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.hash_length = 64;
        config.cache_folder = dir.path().join("cache");
        config.image_folder = dir.path().to_path_buf();
        let _ = Box::leak(Box::new(dir));
        Arc::new(Core::open(config).unwrap())
    }

    #[test]
    fn in_process_ping() {
        let core = test_core();
        let mut front = RpcFront::InProcess { core };
        assert!(front.ping().unwrap());
    }

    #[test]
    fn unknown_op_is_unknown_field() {
        let core = test_core();
        let mut front = RpcFront::InProcess { core };
        let err = front.call("nonexistent", json!({})).unwrap_err();
        assert!(matches!(err, ImgcatError::UnknownField { .. }));
    }

    #[test]
    fn remote_dispatch_round_trips_ping() {
        let core = test_core();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let server_core = Arc::clone(&core);
        std::thread::spawn(move || {
            let _ = serve(server_core, port);
        });
        std::thread::sleep(std::time::Duration::from_millis(200));
        let mut front = RpcFront::connect_or_in_process(port, core);
        assert!(matches!(front, RpcFront::Remote { .. }));
        assert!(front.ping().unwrap());
    }

    #[test]
    fn falls_through_to_in_process_when_unreachable() {
        let core = test_core();
        let front = RpcFront::connect_or_in_process(1, core);
        assert!(matches!(front, RpcFront::InProcess { .. }));
    }
}

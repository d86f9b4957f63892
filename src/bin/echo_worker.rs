//! Reference worker speaking the foreman wire protocol
//!
//! Reads line-delimited JSON commands on stdin and answers on stdout:
//! emits `ready` once at startup, then serves `execute` (built-in skills
//! below), `ping`, `batch` and `batch_compressed` requests serially.
//! Unparseable lines are ignored. Used by the integration tests as the
//! real worker subprocess and usable as a template for custom workers.
//!
//! Built-in skills:
//! - `echo`: returns its params unchanged
//! - `sleep`: sleeps `ms` milliseconds, then reports it
//! - `fail`: replies with an error (`message` param, if given)
//! - `crash`: exits the process without replying

use std::io::{self, BufRead, Write};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use foreman::protocol::{
    encode_line, BatchCallResult, BatchCallSpec, BatchCommand, WorkerCommand, WorkerReply,
};

fn main() {
    let stdout = io::stdout();
    // Startup banner on purpose: orchestrators must tolerate non-JSON
    // noise on the channel.
    eprintln!("echo-worker starting");

    emit(&stdout, &WorkerReply::Ready);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Ok(command) = serde_json::from_str::<WorkerCommand>(&line) {
            handle_command(&stdout, command);
            continue;
        }
        if let Ok(batch) = serde_json::from_str::<BatchCommand>(&line) {
            handle_batch(&stdout, batch);
            continue;
        }
        // Unknown shapes are dropped, mirroring what the orchestrator
        // does with our noise.
    }
}

fn handle_command(stdout: &io::Stdout, command: WorkerCommand) {
    match command {
        WorkerCommand::Execute {
            skill,
            params,
            request_id,
            ..
        } => {
            let started = Instant::now();
            match run_skill(&skill, &params) {
                Ok(result) => emit(
                    stdout,
                    &WorkerReply::Result {
                        request_id,
                        result,
                        execution_time: Some(started.elapsed().as_millis() as u64),
                    },
                ),
                Err(error) => emit(stdout, &WorkerReply::Error { request_id, error }),
            }
        }
        WorkerCommand::Ping { request_id } => {
            emit(stdout, &WorkerReply::Pong { request_id });
        }
    }
}

fn handle_batch(stdout: &io::Stdout, batch: BatchCommand) {
    match batch {
        BatchCommand::Batch {
            request_id,
            requests,
        } => {
            let results = run_batch(&requests);
            emit(
                stdout,
                &WorkerReply::BatchResponse {
                    request_id,
                    results,
                },
            );
        }
        BatchCommand::BatchCompressed {
            request_id,
            data,
            compression,
        } => match decode_batch(&data, &compression) {
            Ok(requests) => {
                let results = run_batch(&requests);
                emit(
                    stdout,
                    &WorkerReply::BatchResponse {
                        request_id,
                        results,
                    },
                );
            }
            Err(error) => emit(stdout, &WorkerReply::Error { request_id, error }),
        },
    }
}

fn run_batch(requests: &[BatchCallSpec]) -> Vec<BatchCallResult> {
    requests
        .iter()
        .map(|request| match run_skill(&request.skill, &request.params) {
            Ok(result) => BatchCallResult {
                id: request.id.clone(),
                success: true,
                result: Some(result),
                error: None,
            },
            Err(error) => BatchCallResult {
                id: request.id.clone(),
                success: false,
                result: None,
                error: Some(error),
            },
        })
        .collect()
}

fn decode_batch(data: &str, compression: &str) -> Result<Vec<BatchCallSpec>, String> {
    if compression != "zstd" {
        return Err(format!("unsupported compression '{}'", compression));
    }
    let compressed = BASE64
        .decode(data.as_bytes())
        .map_err(|e| format!("invalid base64: {}", e))?;
    let bytes = zstd::stream::decode_all(compressed.as_slice())
        .map_err(|e| format!("invalid zstd payload: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid batch payload: {}", e))
}

fn run_skill(skill: &str, params: &Value) -> Result<Value, String> {
    match skill {
        "echo" => Ok(params.clone()),
        "sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(100);
            std::thread::sleep(std::time::Duration::from_millis(ms));
            Ok(json!({ "slept_ms": ms }))
        }
        "fail" => Err(params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("requested failure")
            .to_owned()),
        "crash" => {
            // Simulates a worker dying mid-request.
            std::process::exit(3);
        }
        other => Err(format!("unknown skill: {}", other)),
    }
}

fn emit(stdout: &io::Stdout, reply: &WorkerReply) {
    if let Ok(line) = encode_line(reply) {
        let mut handle = stdout.lock();
        let _ = handle.write_all(line.as_bytes());
        let _ = handle.flush();
    }
}

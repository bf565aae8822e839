//! VoltDB Server - Unix socket server for the VoltDb engine
//!
//! Usage:
//!   voltdb-server <data-dir> [--socket /tmp/voltdb.sock] [--codebook <path>]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]
//!
//! Every request is a map tagged by `cmd`; an optional `requestId` is echoed
//! back. Failures answer `{ error, code }` with the engine's wire code.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use voltdb::frame::{Entry, FrameId, SLOT_DIM};
use voltdb::resource::SystemResources;
use voltdb::{Frame, Query, RecallHit, Status, VoltConfig, VoltDb, VoltError};

/// Global client ID counter
static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

const DEFAULT_SOCKET: &str = "/tmp/voltdb.sock";
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_RECALL_K: usize = 10;
const SLOW_REQUEST_MS: u64 = 100;

// ============================================================================
// Wire Protocol Types
// ============================================================================

/// One resolution level of a slot on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireLevel {
    level: usize,
    vector: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireSlot {
    index: usize,
    gamma: f32,
    levels: Vec<WireLevel>,
}

/// Frame as submitted by a client.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFrame {
    #[serde(default)]
    id: Option<FrameId>,
    strand: String,
    #[serde(default)]
    created_at: Option<u64>,
    #[serde(default)]
    parent: Option<FrameId>,
    #[serde(default)]
    concepts: Vec<String>,
    slots: Vec<WireSlot>,
}

/// Query as submitted by a client. Exactly one selector is expected.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WireQuery {
    Vector { vector: Vec<f32> },
    Strand { strand: String },
    TimeRange { start: u64, end: u64 },
    Concept { concept: String },
    StrandVector { strand: String, vector: Vec<f32> },
}

/// Request from client
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    Ping,
    Store { frame: WireFrame },
    Recall {
        query: WireQuery,
        #[serde(default)]
        k: Option<usize>,
    },
    Get { id: FrameId },
    Pin { id: FrameId },
    Unpin { id: FrameId },
    Status,
    Flush,
    Maintain,
    Consolidate { strand: String },
    PauseBleed,
    ResumeBleed,
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireHit {
    id: FrameId,
    strand: u64,
    created_at: u64,
    gamma: Option<f32>,
    level: &'static str,
    score: f32,
    tier: &'static str,
    ghost_only: bool,
    pinned: bool,
    ref_count: u32,
    parent: Option<FrameId>,
    concepts: Vec<String>,
    /// Full-resolution payloads; only full frames carry them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    slots: Vec<WireSlot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<Vec<f32>>,
}

/// Response to client
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Pong {
        pong: bool,
        version: String,
    },
    Stored {
        ok: bool,
        id: FrameId,
    },
    Recalled {
        hits: Vec<WireHit>,
        #[serde(rename = "lowConfidence")]
        low_confidence: bool,
    },
    Frame {
        frame: WireHit,
    },
    Status {
        status: Box<Status>,
        #[serde(rename = "memoryPressure")]
        memory_pressure: f64,
    },
    Flushed {
        ok: bool,
        #[serde(rename = "runId")]
        run_id: Option<u64>,
    },
    Maintained {
        ok: bool,
        converged: usize,
        evicted: usize,
        archived: usize,
        decayed: usize,
        #[serde(rename = "wisdomFrames")]
        wisdom_frames: usize,
    },
    Consolidated {
        ok: bool,
        clusters: usize,
        #[serde(rename = "wisdomFrames")]
        wisdom_frames: Vec<FrameId>,
        linked: usize,
    },
    Ok {
        ok: bool,
    },
    Error {
        error: String,
        code: String,
    },
}

impl Response {
    fn error(e: &VoltError) -> Self {
        Response::Error {
            error: e.to_string(),
            code: e.code().to_string(),
        }
    }

    fn invalid(message: String) -> Self {
        Response::Error {
            error: message,
            code: "INVALID_REQUEST".to_string(),
        }
    }
}

/// Request envelope: captures requestId alongside the tagged Request.
#[derive(Deserialize)]
struct RequestEnvelope {
    #[serde(default, rename = "requestId")]
    request_id: Option<String>,
    #[serde(flatten)]
    request: Request,
}

/// Response envelope: wraps Response with optional requestId for echo-back.
#[derive(Serialize)]
struct ResponseEnvelope {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(flatten)]
    response: Response,
}

// ============================================================================
// Conversion Helpers
// ============================================================================

fn to_dim(vector: Vec<f32>) -> std::result::Result<[f32; SLOT_DIM], VoltError> {
    let len = vector.len();
    vector
        .try_into()
        .map_err(|_| VoltError::InvalidFrame(format!("vector has {len} dimensions, expected {SLOT_DIM}")))
}

fn wire_to_frame(wire: WireFrame) -> std::result::Result<Frame, VoltError> {
    let mut frame = Frame::new(&wire.strand);
    frame.id = wire.id.unwrap_or(0);
    if let Some(created_at) = wire.created_at {
        frame.created_at = created_at;
    }
    frame.parent = wire.parent;
    frame.concepts = wire.concepts;
    for slot in wire.slots {
        let mut levels = Vec::with_capacity(slot.levels.len());
        for level in slot.levels {
            levels.push((level.level, to_dim(level.vector)?));
        }
        frame.fill_slot(slot.index, slot.gamma, &levels)?;
    }
    Ok(frame)
}

fn wire_query(query: WireQuery) -> Query {
    match query {
        WireQuery::Vector { vector } => Query::Vector(vector),
        WireQuery::Strand { strand } => Query::Strand(strand),
        WireQuery::TimeRange { start, end } => Query::TimeRange { start, end },
        WireQuery::Concept { concept } => Query::Concept(concept),
        WireQuery::StrandVector { strand, vector } => Query::StrandVector { strand, vector },
    }
}

fn hit_to_wire(hit: &RecallHit) -> WireHit {
    let entry = hit.entry.as_ref();
    let slots = match entry {
        Entry::Full(frame) => frame
            .filled_slots()
            .map(|(index, slot)| WireSlot {
                index,
                gamma: slot.gamma,
                levels: slot
                    .levels
                    .iter()
                    .enumerate()
                    .filter_map(|(level, p)| {
                        p.as_ref().map(|p| WireLevel {
                            level,
                            vector: p.vector.to_vec(),
                        })
                    })
                    .collect(),
            })
            .collect(),
        _ => Vec::new(),
    };
    let summary = match entry {
        Entry::Full(_) => None,
        other => other.summary_vector().map(|v| v.to_vec()),
    };
    WireHit {
        id: entry.id(),
        strand: entry.strand(),
        created_at: entry.created_at(),
        gamma: entry.gamma(),
        level: entry.level().as_str(),
        score: hit.score,
        tier: hit.tier.as_str(),
        ghost_only: hit.ghost_only,
        pinned: entry.pinned(),
        ref_count: entry.ref_count(),
        parent: entry.parent(),
        concepts: entry.concepts().to_vec(),
        slots,
        summary,
    }
}

fn operation_name(request: &Request) -> &'static str {
    match request {
        Request::Ping => "ping",
        Request::Store { .. } => "store",
        Request::Recall { .. } => "recall",
        Request::Get { .. } => "get",
        Request::Pin { .. } => "pin",
        Request::Unpin { .. } => "unpin",
        Request::Status => "status",
        Request::Flush => "flush",
        Request::Maintain => "maintain",
        Request::Consolidate { .. } => "consolidate",
        Request::PauseBleed => "pause_bleed",
        Request::ResumeBleed => "resume_bleed",
        Request::Shutdown => "shutdown",
    }
}

// ============================================================================
// Request Handler
// ============================================================================

fn handle_request(db: &VoltDb, request: Request) -> Response {
    let ok = |r: voltdb::Result<()>| match r {
        Ok(()) => Response::Ok { ok: true },
        Err(e) => Response::error(&e),
    };

    match request {
        Request::Ping => Response::Pong {
            pong: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        },

        Request::Store { frame } => match wire_to_frame(frame).and_then(|f| db.store(f)) {
            Ok(id) => Response::Stored { ok: true, id },
            Err(e) => Response::error(&e),
        },

        Request::Recall { query, k } => {
            let k = k.unwrap_or(DEFAULT_RECALL_K);
            if k == 0 {
                return Response::invalid("k must be at least 1".to_string());
            }
            match db.recall(&wire_query(query), k) {
                Ok(result) => Response::Recalled {
                    hits: result.hits.iter().map(hit_to_wire).collect(),
                    low_confidence: result.low_confidence,
                },
                Err(e) => Response::error(&e),
            }
        }

        Request::Get { id } => match db.get(id) {
            Ok(hit) => Response::Frame { frame: hit_to_wire(&hit) },
            Err(e) => Response::error(&e),
        },

        Request::Pin { id } => ok(db.pin(id)),
        Request::Unpin { id } => ok(db.unpin(id)),

        Request::Status => Response::Status {
            status: Box::new(db.status()),
            memory_pressure: SystemResources::detect().memory_pressure(),
        },

        Request::Flush => match db.flush() {
            Ok(meta) => Response::Flushed {
                ok: true,
                run_id: meta.map(|m| m.id),
            },
            Err(e) => Response::error(&e),
        },

        Request::Maintain => match db.maintain() {
            Ok(report) => Response::Maintained {
                ok: true,
                converged: report.converged,
                evicted: report.evicted,
                archived: report.archived,
                decayed: report.decayed,
                wisdom_frames: report.wisdom_frames,
            },
            Err(e) => Response::error(&e),
        },

        Request::Consolidate { strand } => match db.consolidate_strand(&strand) {
            Ok(report) => Response::Consolidated {
                ok: true,
                clusters: report.clusters,
                wisdom_frames: report.wisdom_frames,
                linked: report.linked,
            },
            Err(e) => Response::error(&e),
        },

        Request::PauseBleed => {
            db.pause_bleed();
            Response::Ok { ok: true }
        }

        Request::ResumeBleed => {
            db.resume_bleed();
            Response::Ok { ok: true }
        }

        Request::Shutdown => ok(db.close()),
    }
}

// ============================================================================
// Client Connection Handler
// ============================================================================

fn read_message(stream: &mut impl Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_message(stream: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()
}

fn send(stream: &mut UnixStream, envelope: &ResponseEnvelope) -> std::io::Result<()> {
    match rmp_serde::to_vec_named(envelope) {
        Ok(bytes) => write_message(stream, &bytes),
        Err(e) => {
            error!(error = %e, "response serialization failed");
            Ok(())
        }
    }
}

/// Serve one client until it disconnects. Returns true when the client
/// asked the server to shut down.
fn handle_client(mut stream: UnixStream, db: Arc<VoltDb>, client_id: usize) -> bool {
    debug!(client_id, "client connected");

    loop {
        let msg = match read_message(&mut stream) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(client_id, "client disconnected");
                return false;
            }
            Err(e) => {
                warn!(client_id, error = %e, "client read error");
                return false;
            }
        };

        let (request_id, request) = match rmp_serde::from_slice::<RequestEnvelope>(&msg) {
            Ok(env) => (env.request_id, env.request),
            Err(e) => {
                let envelope = ResponseEnvelope {
                    request_id: None,
                    response: Response::invalid(format!("Invalid request: {}", e)),
                };
                if send(&mut stream, &envelope).is_err() {
                    return false;
                }
                continue;
            }
        };

        let is_shutdown = matches!(request, Request::Shutdown);
        let op = operation_name(&request);
        let start = Instant::now();
        let response = handle_request(&db, request);
        let duration_ms = start.elapsed().as_millis() as u64;
        if duration_ms >= SLOW_REQUEST_MS {
            warn!(client_id, op, duration_ms, "slow request");
        }

        if let Err(e) = send(&mut stream, &ResponseEnvelope { request_id, response }) {
            warn!(client_id, error = %e, "client write error");
            return is_shutdown;
        }
        if is_shutdown {
            info!(client_id, "shutdown requested");
            return true;
        }
    }
}

// ============================================================================
// Main
// ============================================================================

fn print_usage() {
    println!("voltdb-server {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: voltdb-server <data-dir> [--socket <socket-path>] [--codebook <path>]");
    println!();
    println!("Arguments:");
    println!("  <data-dir>     Engine data directory");
    println!("  --socket       Unix socket path (default: {DEFAULT_SOCKET})");
    println!("  --codebook     Codebook blob (default: <data-dir>/codebook.bin)");
    println!();
    println!("Flags:");
    println!("  -V, --version  Print version information");
    println!("  -h, --help     Print this help message");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Persisted config if present; otherwise size from this machine and
/// persist the result.
fn load_config(data_dir: &Path, codebook: Option<&str>) -> anyhow::Result<VoltConfig> {
    let mut config = match VoltConfig::read_from(data_dir)? {
        Some(config) => config,
        None => {
            let config = VoltConfig::auto_tuned(data_dir)?;
            if data_dir.exists() {
                config.write_to(data_dir)?;
            }
            config
        }
    };
    if let Some(path) = codebook {
        config.codebook_path = PathBuf::from(path);
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("voltdb-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    let Some(data_dir) = args.get(1) else {
        print_usage();
        bail!("missing <data-dir>");
    };
    if data_dir.starts_with("--") {
        bail!("data-dir '{data_dir}' looks like a flag, not a path");
    }

    let data_dir = PathBuf::from(data_dir);
    let socket_path = flag_value(&args, "--socket").unwrap_or(DEFAULT_SOCKET).to_string();
    info!(version = env!("CARGO_PKG_VERSION"), path = %data_dir.display(), "starting voltdb-server");

    let config = load_config(&data_dir, flag_value(&args, "--codebook"))?;
    let db = Arc::new(
        VoltDb::open(&data_dir, config)
            .with_context(|| format!("failed to open engine at {}", data_dir.display()))?,
    );
    if !data_dir.join(voltdb::config::CONFIG_FILE).exists() {
        db.config().write_to(&data_dir)?;
    }

    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).with_context(|| format!("failed to bind {socket_path}"))?;
    info!(socket = %socket_path, "listening");

    let db_for_signal = Arc::clone(&db);
    let socket_for_signal = socket_path.clone();
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
        .context("failed to register signal handlers")?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "signal received, flushing");
            if let Err(e) = db_for_signal.close() {
                error!(error = %e, "flush on shutdown failed");
            }
            let _ = std::fs::remove_file(&socket_for_signal);
            std::process::exit(0);
        }
    });

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                let db = Arc::clone(&db);
                let socket_path = socket_path.clone();
                thread::spawn(move || {
                    if handle_client(stream, db, client_id) {
                        let _ = std::fs::remove_file(&socket_path);
                        std::process::exit(0);
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept error"),
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

//! imgcat CLI: a thin front end over `imgcat-core`'s RPC contract.
//!
//! Exposes one subcommand per operation the spec names as a CLI-consumable
//! contract: `query`, `similar`, `similar-by-hash`, `get`, `update`,
//! `delete`, `complete-uid-prefix`, `tag-complete`, `find-duplicates`,
//! `ping`. Every command attempts the local RPC socket first and falls back
//! to in-process mode when nothing is listening. No logic beyond argument
//! marshalling and JSON pretty-printing lives here.

use clap::{Args, Parser, Subcommand};
use imgcat_core::{Config, Core, ImgcatError, RpcFront};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "imgcat",
    version,
    about = "Query front-end for a local image archive",
    long_about = "imgcat indexes a folder of image sidecars by perceptual hash and metadata.\n\
                  This binary talks to a running `imgcat-core` RPC server on --service-port,\n\
                  falling back to opening the catalog in-process when none is reachable."
)]
struct CliArgs {
    /// Folder containing the watched image sidecars (default: current directory)
    #[arg(long, global = true, value_name = "PATH")]
    image_folder: Option<PathBuf>,

    /// Folder holding the catalog and trie snapshot (default: .imgcat/cache)
    #[arg(long, global = true, value_name = "PATH")]
    cache_folder: Option<PathBuf>,

    /// RPC port to try before falling back to in-process mode
    #[arg(long, global = true, value_name = "PORT")]
    service_port: Option<u16>,

    /// Hash width in bits, must match the running index (default: 256)
    #[arg(long, global = true, value_name = "BITS")]
    hash_length: Option<usize>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Filter the catalog by field equality and keyword membership
    Query(QueryArgs),
    /// Find catalog images perceptually similar to an existing uid
    Similar(SimilarArgs),
    /// Find catalog images perceptually similar to a raw hex hash
    SimilarByHash(SimilarByHashArgs),
    /// Fetch one record by uid
    Get(UidArgs),
    /// Replace a record's metadata (reads a full Record as JSON)
    Update(UpdateArgs),
    /// Remove a record and its trie entry (if no other record shares the hash)
    Delete(UidArgs),
    /// List uids starting with a prefix (bounded to 25 results)
    CompleteUidPrefix(PrefixArgs),
    /// List known tags starting with a prefix (bounded to 25 results)
    TagComplete(PrefixArgs),
    /// Group uids sharing a hash, largest group first
    FindDuplicates,
    /// Check whether the RPC server (or in-process core) is reachable
    Ping,
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long)]
    author: Option<String>,
    #[arg(long)]
    caption: Option<String>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    rating: Option<String>,
    /// May be repeated; results must carry every keyword given
    #[arg(long = "keyword")]
    keywords: Vec<String>,
    /// May be repeated; results must carry none of these keywords
    #[arg(long = "not-keyword")]
    not_keywords: Vec<String>,
    #[arg(long)]
    limit: Option<usize>,
    /// Shuffle the base result set before filtering (stable for this run)
    #[arg(long)]
    random: bool,
}

#[derive(Args)]
struct SimilarArgs {
    uid: String,
    #[arg(long, default_value_t = 0.9)]
    threshold: f64,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Args)]
struct SimilarByHashArgs {
    /// Hex-encoded hash, `hash_length` bits wide
    hash: String,
    #[arg(long, default_value_t = 0.9)]
    threshold: f64,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Args)]
struct UidArgs {
    uid: String,
}

#[derive(Args)]
struct UpdateArgs {
    uid: String,
    /// Path to a JSON-encoded Record, or `-` for stdin
    record: String,
}

#[derive(Args)]
struct PrefixArgs {
    prefix: String,
}

fn build_config(args: &CliArgs) -> Config {
    let mut config = Config::default();
    if let Some(ref path) = args.image_folder {
        config.image_folder = path.clone();
    }
    if let Some(ref path) = args.cache_folder {
        config.cache_folder = path.clone();
    }
    if let Some(port) = args.service_port {
        config.service_port = port;
    }
    if let Some(bits) = args.hash_length {
        config.hash_length = bits;
    }
    config
}

fn front(config: Config) -> imgcat_core::Result<RpcFront> {
    let port = config.service_port;
    let core = Arc::new(Core::open(config)?);
    Ok(RpcFront::connect_or_in_process(port, core))
}

fn run(args: CliArgs) -> imgcat_core::Result<Value> {
    let config = build_config(&args);
    let hash_length = config.hash_length;
    let mut front = front(config)?;
    match args.cmd {
        Cmd::Query(q) => front.call(
            "query",
            json!({
                "author": q.author,
                "caption": q.caption,
                "source": q.source,
                "rating": q.rating,
                "keyword": q.keywords,
                "not_keyword": q.not_keywords,
                "limit": q.limit,
                "random": q.random,
            }),
        ),
        Cmd::Similar(s) => front.call(
            "similar",
            json!({ "uid": s.uid, "threshold": s.threshold, "limit": s.limit }),
        ),
        Cmd::SimilarByHash(s) => {
            let hash = imgcat_core::Hash::from_hex(&s.hash, hash_length)?;
            front.call(
                "similar_by_hash",
                json!({ "hash": hash, "threshold": s.threshold, "limit": s.limit }),
            )
        }
        Cmd::Get(u) => front.call("get", json!({ "uid": u.uid })),
        Cmd::Update(u) => {
            let text = if u.record == "-" {
                std::io::read_to_string(std::io::stdin()).map_err(ImgcatError::from)?
            } else {
                std::fs::read_to_string(&u.record).map_err(ImgcatError::from)?
            };
            let mut record: Value = serde_json::from_str(&text).map_err(ImgcatError::from)?;
            record["uid"] = json!(u.uid);
            front.call("update", json!({ "record": record }))
        }
        Cmd::Delete(u) => front.call("delete", json!({ "uid": u.uid })),
        Cmd::CompleteUidPrefix(p) => front.call("complete_uid_prefix", json!({ "prefix": p.prefix })),
        Cmd::TagComplete(p) => front.call("tag_complete", json!({ "prefix": p.prefix })),
        Cmd::FindDuplicates => front.call("find_duplicates", json!({})),
        Cmd::Ping => front.call("ping", json!({})),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = CliArgs::parse();
    match run(args) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap());
        }
        Err(e) => {
            let exit_code = e.exit_code();
            let error_output = serde_json::to_string_pretty(&e).unwrap_or_else(|_| {
                format!("{{\"error\":\"{e}\"}}")
            });
            eprintln!("{error_output}");
            exit(exit_code);
        }
    }
}

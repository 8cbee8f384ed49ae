use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use recall::config::{EngineConfig, DEFAULT_RESULTS, MAX_RESULTS};
use recall::embedding::{
    Embedder, HashEmbedder, OpenAiEmbedder, DEFAULT_HASH_DIMENSION, DEFAULT_OPENAI_BASE_URL,
    DEFAULT_OPENAI_MODEL,
};
use recall::manager::{self, SystemProfile};
use recall::server::RecallServer;
use recall::vector::Metric;
use recall::RecallDb;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "RECALL_ADDR", default_value = "127.0.0.1:9000")]
    addr: String,

    /// Deployment root holding the manifest and collection segments.
    #[clap(long, env = "RECALL_DATA_DIR", default_value = "./recall_db")]
    data_dir: PathBuf,

    /// cosine or euclidean; fixed once the deployment exists.
    #[clap(long, default_value = "cosine")]
    metric: Metric,

    /// Uses the remote embedding API when set, the local hashing embedder otherwise.
    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[clap(long, env = "RECALL_EMBEDDING_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    embedding_url: String,

    #[clap(long, env = "RECALL_EMBEDDING_MODEL", default_value = DEFAULT_OPENAI_MODEL)]
    embedding_model: String,

    #[clap(long, default_value_t = DEFAULT_HASH_DIMENSION)]
    hash_dimension: usize,

    #[clap(long, default_value_t = MAX_RESULTS)]
    max_results: usize,

    #[clap(long, default_value_t = DEFAULT_RESULTS)]
    context_results: usize,

    /// Background compaction period in seconds; off when absent.
    #[clap(long, env = "RECALL_COMPACT_SECS")]
    compact_secs: Option<u64>,

    /// Skip the per-write fsync. Acknowledged writes may then be lost on a
    /// crash until the next flush.
    #[clap(long, env = "RECALL_RELAXED_DURABILITY")]
    relaxed_durability: bool,
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,recall=info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let profile = SystemProfile::detect();
    info!(
        cores = profile.logical_cores,
        workers = profile.worker_threads,
        blocking = profile.blocking_threads,
        "system profile"
    );

    let mut config = EngineConfig::new(&args.data_dir)
        .with_metric(args.metric)
        .with_strict_durability(!args.relaxed_durability)
        .with_max_results(args.max_results)
        .with_context_results(args.context_results);
    if let Some(secs) = args.compact_secs.filter(|s| *s > 0) {
        config = config.with_compact_interval(Duration::from_secs(secs));
    }
    if config.strict_durability {
        info!(durability = "strict (fsync)", "engine configuration");
    } else {
        warn!(durability = "relaxed", "writes are acknowledged before they reach disk");
    }

    let embedder = build_embedder(&args);
    let compact_interval = config.compact_interval;
    let db = match RecallDb::open(config, embedder) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(error = %e, "could not open the deployment");
            std::process::exit(1);
        }
    };

    if let Some(every) = compact_interval {
        manager::start_compaction_thread(Arc::downgrade(&db), every);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .max_blocking_threads(profile.blocking_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "could not start the runtime");
            std::process::exit(1);
        }
    };

    let server = RecallServer::new(db.clone());
    runtime.block_on(async {
        tokio::select! {
            res = server.run(&args.addr) => {
                if let Err(e) = res {
                    error!(error = %e, addr = %args.addr, "server stopped");
                }
            }
            _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        }
    });
    drop(server);
    runtime.shutdown_timeout(Duration::from_secs(5));

    let outcome = match Arc::try_unwrap(db) {
        Ok(db) => db.close(),
        Err(shared) => {
            warn!("engine still referenced at shutdown, flushing instead of closing");
            shared.flush()
        }
    };
    if let Err(e) = outcome {
        error!(error = %e, "shutdown flush failed");
        std::process::exit(1);
    }
}

fn build_embedder(args: &Args) -> Arc<dyn Embedder> {
    if let Some(key) = args.openai_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        match OpenAiEmbedder::with_options(
            key,
            &args.embedding_url,
            &args.embedding_model,
            Duration::from_secs(30),
        ) {
            Ok(embedder) => {
                info!(model = %args.embedding_model, "using remote embeddings");
                return Arc::new(embedder);
            }
            Err(e) => warn!(error = %e, "remote embeddings unavailable, falling back to hashing"),
        }
    }
    info!(dimension = args.hash_dimension, "using local hashing embeddings");
    Arc::new(HashEmbedder::new(args.hash_dimension))
}

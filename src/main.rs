#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]

//! SillyProxy entry point
//!
//! Wires the credential store, the certificate selector, the route table
//! and the forwarder together, then serves until a termination signal
//! arrives. The `keystore` subcommand maintains the credential archive
//! and never starts the proxy.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use sillyproxy::config::ProxyOptions;
use sillyproxy::credentials::{self, CredentialsHandle};
use sillyproxy::forwarder::Forwarder;
use sillyproxy::keystore;
use sillyproxy::routes::{RouteSpec, RouterTable};
use sillyproxy::selector::SniCertSelector;
use sillyproxy::server::{self, ProxyContext};

/// SillyProxy - SNI-aware TLS-terminating reverse proxy
#[derive(Parser, Debug)]
#[command(name = "sillyproxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Credential archive location
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Credential archive password
    #[arg(long, default_value = "")]
    keypass: String,

    /// Minimum TLS version: 0/1 = TLS1.0, 2 = TLS1.1, 3 = TLS1.2
    #[arg(long = "min-tls-ver", default_value_t = 1)]
    min_tls_ver: u32,

    /// Listen address as host:port
    #[arg(long, default_value = "0.0.0.0:8443")]
    bind: String,

    /// JSON route table location
    #[arg(long)]
    routes: Option<PathBuf>,

    /// Seconds between credential archive reloads
    #[arg(long = "reload-interval", default_value_t = 1800)]
    reload_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a PEM certificate and key into the credential archive
    Keystore {
        /// Host name the certificate serves; `default` marks the fallback
        #[arg(long, default_value = "default")]
        hostname: String,

        /// PEM certificate chain, leaf first
        #[arg(long = "pem-cert")]
        pem_cert: PathBuf,

        /// PEM private key matching the leaf
        #[arg(long = "pem-key")]
        pem_key: PathBuf,

        /// Replace the alias if it already exists
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the process-wide crypto provider before any TLS object is
    // built.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(&args.log_level);

    // The password is used as raw bytes from here on and wiped before
    // exit. (The clap-owned String cannot be scrubbed; see DESIGN.md.)
    let password = Arc::new(Zeroizing::new(args.keypass.as_bytes().to_vec()));

    if let Some(Command::Keystore {
        hostname,
        pem_cert,
        pem_key,
        force,
    }) = args.command
    {
        let store_path = args
            .keystore
            .ok_or_else(|| anyhow::anyhow!("missing required flag --keystore"))?;
        let alias = keystore::import_entry(
            &store_path,
            &password,
            &hostname,
            &pem_cert,
            &pem_key,
            force,
        )?;
        info!(alias = %alias, path = %store_path.display(), "certificate imported");
        return Ok(());
    }

    let options = ProxyOptions::from_flags(
        args.keystore,
        &args.bind,
        args.routes,
        args.min_tls_ver,
        args.reload_interval,
    )?;

    info!("Starting SillyProxy v{}", env!("CARGO_PKG_VERSION"));

    // Route table: parsed and compiled once, immutable afterwards.
    let spec = RouteSpec::load(&options.routes)
        .map_err(|e| anyhow::anyhow!("RouteMap build failed: {e}"))?;
    let table =
        RouterTable::compile(&spec).map_err(|e| anyhow::anyhow!("RouteMap build failed: {e}"))?;

    // Initial credential snapshot; a failure here is fatal.
    let store = credentials::load_credentials(&options.keystore, &password)
        .map_err(|e| anyhow::anyhow!("certificate load failed: {e}"))?;
    info!(entries = store.len(), "credential snapshot loaded");
    let handle = Arc::new(CredentialsHandle::new(store));

    // Background refresher, stopped through a one-shot channel at
    // shutdown.
    let (stop_tx, stop_rx) = oneshot::channel();
    let refresher = credentials::spawn_refresher(
        handle.clone(),
        options.keystore.clone(),
        password.clone(),
        options.reload_interval,
        stop_rx,
    );

    let selector = Arc::new(SniCertSelector::new(handle.clone()));
    let tls_config = server::build_tls_config(selector, options.min_tls);

    let ctx = Arc::new(ProxyContext {
        table,
        forwarder: Forwarder::new(),
    });

    print_startup_summary(&options, &ctx);

    let server_task = tokio::spawn(server::run(options.bind, tls_config, ctx));

    shutdown_signal().await;
    info!("termination signal received; purging keystore secret and certificate map");

    // Stop the refresher, drop every credential, wipe the password.
    let _ = stop_tx.send(());
    if let Err(e) = refresher.await {
        warn!(error = %e, "refresher task did not stop cleanly");
    }
    handle.clear();
    drop(password);

    server_task.abort();
    info!("Goodbye!");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Wait for any of the termination signals the proxy honors.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    // SIGIOT is an alias of SIGABRT; SIGTSTP has no named SignalKind.
    const SIGABRT: i32 = 6;
    const SIGTSTP: i32 = 20;

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
    let mut sigabrt =
        signal(SignalKind::from_raw(SIGABRT)).expect("failed to install SIGABRT handler");
    let mut sigtstp =
        signal(SignalKind::from_raw(SIGTSTP)).expect("failed to install SIGTSTP handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
        _ = sigabrt.recv() => info!("received SIGABRT"),
        _ = sigtstp.recv() => info!("received SIGTSTP"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to wait for ctrl-c");
    }
}

/// Print startup summary
fn print_startup_summary(options: &ProxyOptions, ctx: &ProxyContext) {
    info!("═══════════════════════════════════════════════");
    info!("  SillyProxy v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════");
    info!("  Listen:        {}", options.bind);
    info!(
        "  TLS floor:     {} (requested {})",
        options.min_tls.effective(),
        options.min_tls.requested()
    );
    info!("  Hosts routed:  {}", ctx.table.host_count());
    info!("  Keystore:      {}", options.keystore.display());
    info!(
        "  Reload every:  {}s",
        options.reload_interval.as_secs()
    );
    info!("═══════════════════════════════════════════════");
}

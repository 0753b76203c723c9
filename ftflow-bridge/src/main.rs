use std::io;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ftflow_bridge::config::{Args, Config, Source};
use ftflow_bridge::{
    Accounting, BufferPool, Dispatcher, FlowEngine, FlowTable, LineExporter, PcapPort, ShutdownToken,
    StatsReporter,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args(Args::parse())?;

    // Logs go to stderr, stdout carries flow records
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let pool = BufferPool::new(config.pool_size, config.slot_size).context("Cannot create packet buffer pool")?;
    info!("Buffer pool: {} slots of {} bytes", config.pool_size, pool.slot_size());

    let (primary, twin) = match &config.source {
        Source::Live { primary, twin } => {
            let primary_port = PcapPort::open_live(primary, &config.port)
                .with_context(|| format!("Cannot init port {}", primary))?;
            let twin_port = twin
                .as_deref()
                .map(|name| {
                    PcapPort::open_live(name, &config.port).with_context(|| format!("Cannot init port {}", name))
                })
                .transpose()?;
            (primary_port, twin_port)
        }
        Source::Offline(path) => (PcapPort::open_offline(path)?, None),
    };

    if config.is_bridge() {
        info!("Bridge mode, frames longer than {} bytes are not forwarded", pool.slot_size());
    }

    let mut table = FlowTable::new(config.flow_table.clone()).context("Cannot create flow table")?;
    table.set_exporter(Box::new(LineExporter::new(io::stdout())));
    if !config.dispatch.compute_flows {
        info!("Flow computation disabled, counting packets only");
    }

    let accounting = Accounting::new();
    let shutdown = ShutdownToken::new();

    let mut dispatcher = Dispatcher::new(
        primary,
        twin,
        table,
        pool.clone(),
        Arc::clone(&accounting),
        config.dispatch,
    );

    let dispatch_shutdown = shutdown.clone();
    let core = config.core;
    let dispatch = thread::Builder::new()
        .name("dispatch".to_string())
        .spawn(move || {
            if let Some(id) = core {
                pin_to_core(id);
            }
            dispatcher.run(&dispatch_shutdown);
            dispatcher.finish(&dispatch_shutdown);
        })
        .context("Failed to spawn dispatch thread")?;

    let reporter = tokio::spawn(StatsReporter::new(Arc::clone(&accounting)).run(shutdown.clone(), io::stderr()));

    let signal_shutdown = shutdown.clone();
    let signals = tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_signal().await {
                warn!("Cannot listen for shutdown signals: {}", e);
                break;
            }
            if signal_shutdown.trigger() {
                info!("Leaving...");
            } else {
                debug!("Shutdown already in progress");
            }
        }
    });

    let joined = tokio::task::spawn_blocking(move || dispatch.join())
        .await
        .context("Failed to wait for dispatch thread")?;
    signals.abort();

    if joined.is_err() {
        error!("Dispatch thread panicked");
        shutdown.trigger();
        return Err(anyhow!("Dispatch thread panicked"));
    }

    if let Err(e) = reporter.await {
        warn!("Stats reporter ended abnormally: {}", e);
    }

    let totals = accounting.snapshot();
    let pool_stats = pool.get_stats();
    info!(
        "Processed {} packets, {} bytes, {} flows, {} flow errors",
        totals.packets, totals.bytes, totals.flows, totals.errors
    );
    if pool_stats.exhausted > 0 {
        warn!("Buffer pool ran dry {} times", pool_stats.exhausted);
    }
    debug!("Buffer pool at exit: {:.1}% in use", pool_stats.utilization());

    Ok(())
}

async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn pin_to_core(id: usize) {
    let core_ids = match core_affinity::get_core_ids() {
        Some(ids) => ids,
        None => {
            info!("CPU affinity not supported on this platform, continuing without core pinning");
            return;
        }
    };

    match core_ids.into_iter().find(|core| core.id == id) {
        Some(core) if core_affinity::set_for_current(core) => info!("Dispatch thread pinned to CPU core {}", id),
        Some(_) => warn!("Failed to set CPU affinity to core {}", id),
        None => warn!("CPU core {} not available, continuing without core pinning", id),
    }
}

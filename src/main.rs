use anyhow::Context;
use tcplb::backend::ServerGroup;
use tcplb::check::{HealthCheckClient, HealthCheckConfig};
use tcplb::config::Config;
use tcplb::connection::{Listener, NetEventLoop};
use tcplb::group::EventLoopGroup;
use tcplb::proxy::{Proxy, ProxyNetConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::load().context("failed to load configuration")?;

    let workers = EventLoopGroup::new("worker", cfg.workers).context("failed to start event loops")?;
    let accept_loop = workers.next().context("no event loop available")?;

    let servers = ServerGroup::new("backends");
    let health_config = HealthCheckConfig::from(cfg.health_check);
    let mut health_checks = Vec::with_capacity(cfg.backends.len());
    for backend in &cfg.backends {
        let handle = servers.add(backend.display_name(), backend.address, backend.local_ip())?;
        let event_loop: NetEventLoop = workers.next().context("no event loop available")?;
        let local = backend.local.map(|ip| std::net::SocketAddr::new(ip, 0));
        let check = HealthCheckClient::new(event_loop, backend.address, local, health_config, handle);
        check.start();
        health_checks.push(check);
    }

    let listener = Listener::bind(cfg.listen).with_context(|| format!("failed to bind {}", cfg.listen))?;
    let proxy = Proxy::new(
        ProxyNetConfig::new()
            .accept_loop(accept_loop)
            .loop_chooser(workers.clone())
            .backend_chooser(servers.clone())
            .listener(listener.clone())
            .in_buffer_size(cfg.in_buffer_size)
            .out_buffer_size(cfg.out_buffer_size),
        (),
    )?;
    proxy.handle()?;
    tracing::info!(listen = %listener.local_addr(), backends = cfg.backends.len(), "tcplb running");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown signal received");

    proxy.stop();
    for check in &health_checks {
        check.stop();
    }
    listener.close();
    tokio::task::spawn_blocking(move || workers.close()).await?;
    tracing::info!(sessions = proxy.session_count(), "tcplb stopped");

    Ok(())
}
